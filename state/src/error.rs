use ethereum_types::H256;
use mpt_trie::nibbles::BytesToNibblesError;
use mpt_trie::trie_ops::TrieOpError;

use crate::kv::StoreError;

/// Errors surfaced by the state and record layers.
///
/// A missing entry is never an error: lookups return [`None`] instead.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Trie(#[from] TrieOpError),

    #[error(transparent)]
    Key(#[from] BytesToNibblesError),

    #[error("rlp decoding failed: {0}")]
    Rlp(#[from] rlp::DecoderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown trie root {0:?}")]
    UnknownRoot(H256),

    #[error("no checkpoint to {0}")]
    NoCheckpoint(&'static str),

    #[error("remote chain request failed: {0:#}")]
    Remote(#[from] anyhow::Error),
}
