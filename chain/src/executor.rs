//! The boundary to the instruction-level execution engine.
//!
//! The chain never interprets code itself. Anything implementing
//! [`Executor`] can be plugged in; [`TransferExecutor`] covers plain value
//! transfers and contract creation without running init code.

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use rlp::RlpStream;
use serde::Serialize;
use simchain_state::block::Header;
use simchain_state::receipt::Log;
use simchain_state::state_db::StateDb;
use simchain_state::transaction::Transaction;
use simchain_state::StateError;
use thiserror::Error;

pub mod opcode {
    pub const STOP: u8 = 0x00;
    pub const ADD: u8 = 0x01;
    pub const POP: u8 = 0x50;
    pub const SLOAD: u8 = 0x54;
    pub const SSTORE: u8 = 0x55;
    pub const JUMPI: u8 = 0x57;
    pub const GAS: u8 = 0x5a;
    pub const JUMPDEST: u8 = 0x5b;
    pub const PUSH1: u8 = 0x60;
    pub const PUSH20: u8 = 0x73;
    pub const PUSH32: u8 = 0x7f;
    pub const LOG0: u8 = 0xa0;
    pub const LOG1: u8 = 0xa1;
    pub const LOG4: u8 = 0xa4;
    pub const CREATE: u8 = 0xf0;
    pub const CALL: u8 = 0xf1;
    pub const CALLCODE: u8 = 0xf2;
    pub const RETURN: u8 = 0xf3;
    pub const DELEGATECALL: u8 = 0xf4;
    pub const CREATE2: u8 = 0xf5;
    pub const STATICCALL: u8 = 0xfa;
    pub const REVERT: u8 = 0xfd;

    /// Opcodes that open a new call frame.
    pub const fn is_call(op: u8) -> bool {
        matches!(
            op,
            CALL | CALLCODE | DELEGATECALL | STATICCALL | CREATE | CREATE2
        )
    }

    pub fn name(op: u8) -> String {
        match op {
            STOP => "STOP".into(),
            ADD => "ADD".into(),
            POP => "POP".into(),
            SLOAD => "SLOAD".into(),
            SSTORE => "SSTORE".into(),
            JUMPI => "JUMPI".into(),
            GAS => "GAS".into(),
            JUMPDEST => "JUMPDEST".into(),
            PUSH1..=PUSH32 => format!("PUSH{}", op - PUSH1 + 1),
            LOG0..=LOG4 => format!("LOG{}", op - LOG0),
            CREATE => "CREATE".into(),
            CALL => "CALL".into(),
            CALLCODE => "CALLCODE".into(),
            RETURN => "RETURN".into(),
            DELEGATECALL => "DELEGATECALL".into(),
            CREATE2 => "CREATE2".into(),
            STATICCALL => "STATICCALL".into(),
            REVERT => "REVERT".into(),
            other => format!("opcode 0x{other:02x}"),
        }
    }
}

/// The block a transaction executes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub coinbase: Address,
    pub gas_limit: u64,
    pub difficulty: U256,
    /// `None` disables the fee cap check, as for read-only calls.
    pub base_fee: Option<U256>,
    pub chain_id: u64,
}

impl BlockContext {
    pub fn from_header(header: &Header, chain_id: u64) -> Self {
        Self {
            number: header.number,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
            coinbase: header.coinbase,
            gas_limit: header.gas_limit,
            difficulty: header.difficulty,
            base_fee: header.base_fee_per_gas,
            chain_id,
        }
    }
}

/// Why execution stopped abnormally. All remaining gas is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HaltReason {
    #[error("out of gas")]
    OutOfGas,
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    /// Reverted by the code; `return_data` holds the payload.
    Revert,
    Halt(HaltReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// Gas charged to the sender, refund already deducted.
    pub gas_used: u64,
    pub gas_refund: u64,
    pub logs: Vec<Log>,
    pub created_address: Option<Address>,
    pub return_data: Vec<u8>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Human readable failure, `None` on success.
    pub fn error(&self) -> Option<String> {
        match &self.status {
            ExecutionStatus::Success => None,
            ExecutionStatus::Revert => Some(revert_reason(&self.return_data)),
            ExecutionStatus::Halt(reason) => Some(reason.to_string()),
        }
    }
}

/// Failures of the execution environment, as opposed to failures of the
/// executed code. A transaction hitting one of these is never included.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("nonce mismatch: account has {expected}, transaction has {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: U256, have: U256 },

    #[error("max fee per gas {fee_cap} below block base fee {base_fee}")]
    FeeCapTooLow { fee_cap: U256, base_fee: U256 },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{0}")]
    Other(String),
}

/// One executed instruction.
///
/// `gas` is the gas left before the instruction and `gas_cost` what the
/// instruction itself charged, excluding gas handed to a child frame.
/// `stack` is bottom first. `depth` starts at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub pc: u64,
    pub op: u8,
    pub depth: u64,
    pub gas: u64,
    pub gas_cost: u64,
    pub stack: Vec<U256>,
    pub address: Address,
}

pub trait StepTracer: Send {
    fn step(&mut self, step: &Step);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    pub pc: u64,
    pub op: String,
    pub depth: u64,
    pub gas: u64,
    pub gas_cost: u64,
    pub stack: Vec<U256>,
}

/// Records every step.
#[derive(Debug, Default)]
pub struct StructLogger {
    pub steps: Vec<Step>,
}

impl StructLogger {
    pub fn struct_logs(&self) -> Vec<StructLog> {
        self.steps
            .iter()
            .map(|step| StructLog {
                pc: step.pc,
                op: opcode::name(step.op),
                depth: step.depth,
                gas: step.gas,
                gas_cost: step.gas_cost,
                stack: step.stack.clone(),
            })
            .collect()
    }
}

impl StepTracer for StructLogger {
    fn step(&mut self, step: &Step) {
        self.steps.push(step.clone());
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `tx` on `state`. Every effect, including fee payment, is written
    /// to `state`; callers bracket the call with a checkpoint.
    async fn execute(
        &self,
        tx: &Transaction,
        block: &BlockContext,
        state: &mut StateDb,
        tracer: Option<&mut dyn StepTracer>,
    ) -> Result<ExecutionResult, ExecutorError>;
}

/// Address of a contract created by `sender` at `nonce`.
pub fn create_address(sender: Address, nonce: u64) -> Address {
    let mut stream = RlpStream::new_list(2);
    stream.append(&sender);
    stream.append(&nonce);
    Address::from_slice(&keccak(stream.out()).as_bytes()[12..])
}

/// Decodes an `Error(string)` revert payload, falling back to hex.
pub fn revert_reason(data: &[u8]) -> String {
    const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
    let decoded = data
        .strip_prefix(&ERROR_SELECTOR)
        .filter(|body| body.len() >= 64)
        .and_then(|body| {
            let len = U256::from_big_endian(&body[32..64]);
            let len = usize::try_from(len).ok()?;
            let text = body.get(64..len.checked_add(64)?)?;
            String::from_utf8(text.to_vec()).ok()
        });
    match decoded {
        Some(reason) => reason,
        None if data.is_empty() => String::new(),
        None => format!("0x{}", hex::encode(data)),
    }
}

/// Checks the sender can pay for `tx` in `block`, then takes the nonce and
/// the whole gas allowance at the effective price. Returns that price.
pub async fn buy_gas(
    tx: &Transaction,
    block: &BlockContext,
    state: &mut StateDb,
) -> Result<U256, ExecutorError> {
    let mut account = state.account_or_default(tx.from).await?;
    if account.nonce != tx.nonce {
        return Err(ExecutorError::NonceMismatch {
            expected: account.nonce,
            got: tx.nonce,
        });
    }
    if let Some(base_fee) = block.base_fee {
        if tx.fee.max_fee() < base_fee {
            return Err(ExecutorError::FeeCapTooLow {
                fee_cap: tx.fee.max_fee(),
                base_fee,
            });
        }
    }
    let price = tx.fee.effective_gas_price(block.base_fee);
    let need = U256::from(tx.gas_limit)
        .checked_mul(tx.fee.max_fee())
        .and_then(|gas| gas.checked_add(tx.value));
    match need {
        Some(need) if need <= account.balance => {}
        _ => {
            return Err(ExecutorError::InsufficientFunds {
                need: need.unwrap_or(U256::MAX),
                have: account.balance,
            })
        }
    }
    // Covered by `need`, the effective price being at most the fee cap.
    account.balance -= U256::from(tx.gas_limit) * price;
    account.nonce = account
        .nonce
        .checked_add(1)
        .ok_or_else(|| ExecutorError::Other("sender nonce exhausted".into()))?;
    state.put_account(tx.from, &account)?;
    Ok(price)
}

/// Returns unused gas to the sender and pays the priority fee to the
/// coinbase. The base fee portion is burned.
pub async fn settle_gas(
    tx: &Transaction,
    block: &BlockContext,
    state: &mut StateDb,
    gas_used: u64,
    price: U256,
) -> Result<(), ExecutorError> {
    let unused = U256::from(tx.gas_limit.saturating_sub(gas_used)).saturating_mul(price);
    let balance = state.balance(tx.from).await?;
    state.set_balance(tx.from, balance.saturating_add(unused)).await?;

    let tip = price.saturating_sub(block.base_fee.unwrap_or_default());
    if !tip.is_zero() {
        let reward = U256::from(gas_used).saturating_mul(tip);
        let balance = state.balance(block.coinbase).await?;
        state
            .set_balance(block.coinbase, balance.saturating_add(reward))
            .await?;
    }
    Ok(())
}

/// Moves `value` between accounts. Returns false, changing nothing, when
/// `from` cannot afford it or `to` cannot hold it.
pub async fn transfer(
    state: &mut StateDb,
    from: Address,
    to: Address,
    value: U256,
) -> Result<bool, StateError> {
    if value.is_zero() {
        return Ok(true);
    }
    let balance = state.balance(from).await?;
    if balance < value {
        return Ok(false);
    }
    if from == to {
        return Ok(true);
    }
    let Some(credited) = state.balance(to).await?.checked_add(value) else {
        return Ok(false);
    };
    state.set_balance(from, balance - value).await?;
    state.set_balance(to, credited).await?;
    Ok(true)
}

/// Executes value transfers. A creation stores its data as the new
/// contract's code without running it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferExecutor;

#[async_trait]
impl Executor for TransferExecutor {
    async fn execute(
        &self,
        tx: &Transaction,
        block: &BlockContext,
        state: &mut StateDb,
        _tracer: Option<&mut dyn StepTracer>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let price = buy_gas(tx, block, state).await?;
        let intrinsic = tx.intrinsic_gas();
        if intrinsic > tx.gas_limit {
            settle_gas(tx, block, state, tx.gas_limit, price).await?;
            return Ok(ExecutionResult {
                status: ExecutionStatus::Halt(HaltReason::OutOfGas),
                gas_used: tx.gas_limit,
                gas_refund: 0,
                logs: Vec::new(),
                created_address: None,
                return_data: Vec::new(),
            });
        }

        let created_address = tx.is_create().then(|| create_address(tx.from, tx.nonce));
        if let Some(recipient) = tx.to.or(created_address) {
            // Affordability was checked with the gas.
            transfer(state, tx.from, recipient, tx.value).await?;
        }
        if let Some(created) = created_address {
            state.set_code(created, tx.data.clone()).await?;
        }

        settle_gas(tx, block, state, intrinsic, price).await?;
        Ok(ExecutionResult {
            status: ExecutionStatus::Success,
            gas_used: intrinsic,
            gas_refund: 0,
            logs: Vec::new(),
            created_address,
            return_data: Vec::new(),
        })
    }
}
