use ethereum_types::H256;
use simchain_state::kv::StoreError;
use simchain_state::StateError;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::txpool::RejectReason;

/// Why a transaction was refused entry to the pool. A refused transaction
/// never enters any queue.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("exceeds block gas limit")]
    GasLimitExceeded,

    #[error("intrinsic gas too low: gas limit {limit}, intrinsic gas {intrinsic}")]
    IntrinsicGasTooLow { limit: u64, intrinsic: u64 },

    #[error("nonce too low: got {got}, expected at least {expected}")]
    NonceTooLow { got: u64, expected: u64 },

    #[error("transaction underpriced")]
    Underpriced,

    #[error("invalid chain id: got {got}, expected {expected}")]
    InvalidChainId { got: u64, expected: u64 },

    #[error("signing failed: {0}")]
    Signer(anyhow::Error),

    #[error("transaction pool is stopped")]
    Stopped,

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("transaction rejected: {reason}")]
    Rejected { reason: RejectReason },

    #[error("transaction {hash:?} failed: {reason}")]
    TransactionFailed { hash: H256, reason: String },

    /// A read-only call did not succeed. `data` is the revert payload.
    #[error("execution reverted: {reason}")]
    CallError { reason: String, data: Vec<u8> },

    #[error("gas required exceeds allowance or always failing transaction")]
    EstimationFailed,

    #[error("unknown block")]
    UnknownBlock,

    #[error("unknown transaction {0:?}")]
    UnknownTransaction(H256),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] anyhow::Error),

    #[error("blockchain is not started")]
    NotStarted,
}
