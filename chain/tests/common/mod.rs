//! A small stack machine executor and chain builders shared by the
//! integration tests.
//!
//! The machine has no memory: `LOGn` emits empty data, and `RETURN`/`REVERT`
//! return nothing. `CALL` forwards all but one 64th of the remaining gas at
//! most and adds a stipend to value transfers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::{Address, BigEndianHash as _, H256, U256};
use futures::future::BoxFuture;
use simchain::blockchain::{Blockchain, GenesisAccount};
use simchain::config::{ChainConfig, MiningMode};
use simchain::executor::{
    buy_gas, create_address, opcode, settle_gas, transfer, BlockContext, ExecutionResult,
    ExecutionStatus, Executor, ExecutorError, HaltReason, Step, StepTracer,
};
use simchain_common::{eth_to_wei, gas::CALL_STIPEND};
use simchain_state::kv::MemoryStore;
use simchain_state::managers::ChainDb;
use simchain_state::receipt::Log;
use simchain_state::remote::ForkClient;
use simchain_state::state_db::StateDb;
use simchain_state::transaction::{Transaction, TransactionRequest};
use simchain_state::trie::TrieDb;

pub const ALICE: Address = Address::repeat_byte(0xa1);
pub const BOB: Address = Address::repeat_byte(0xb0);
pub const CAROL: Address = Address::repeat_byte(0xc0);
pub const DAVE: Address = Address::repeat_byte(0xd0);

const SLOAD_GAS: u64 = 100;
const SSTORE_SET_GAS: u64 = 20_000;
const SSTORE_RESET_GAS: u64 = 2_900;
const SSTORE_CLEARS_REFUND: u64 = 4_800;
const WARM_ACCESS_GAS: u64 = 100;
const CALL_VALUE_GAS: u64 = 9_000;
const LOG_GAS: u64 = 375;

struct Outcome {
    status: ExecutionStatus,
    gas_left: u64,
}

impl Outcome {
    const fn halt(reason: HaltReason) -> Self {
        Self {
            status: ExecutionStatus::Halt(reason),
            gas_left: 0,
        }
    }
}

struct Interpreter<'a, 't> {
    state: &'a mut StateDb,
    tracer: Option<&'a mut (dyn StepTracer + 't)>,
    logs: Vec<Log>,
    refund: u64,
}

impl Interpreter<'_, '_> {
    /// Runs the code of `address` in a child frame. Effects are kept only
    /// if the frame succeeds.
    fn call(
        &mut self,
        caller: Address,
        address: Address,
        value: U256,
        gas: u64,
        depth: u64,
    ) -> BoxFuture<'_, Result<Outcome, ExecutorError>> {
        Box::pin(async move {
            self.state.checkpoint();
            let logs = self.logs.len();
            let refund = self.refund;
            if !transfer(self.state, caller, address, value).await? {
                self.state.revert()?;
                return Ok(Outcome {
                    status: ExecutionStatus::Revert,
                    gas_left: gas,
                });
            }
            let code = self.state.code(address).await?;
            let outcome = if code.is_empty() {
                Outcome {
                    status: ExecutionStatus::Success,
                    gas_left: gas,
                }
            } else {
                self.run(address, &code, gas, depth).await?
            };
            if outcome.status == ExecutionStatus::Success {
                self.state.commit()?;
            } else {
                self.state.revert()?;
                self.logs.truncate(logs);
                self.refund = refund;
            }
            Ok(outcome)
        })
    }

    async fn run(
        &mut self,
        address: Address,
        code: &[u8],
        mut gas: u64,
        depth: u64,
    ) -> Result<Outcome, ExecutorError> {
        let mut stack: Vec<U256> = Vec::new();
        let mut pc = 0;
        loop {
            let op = code.get(pc).copied().unwrap_or(opcode::STOP);
            let cost = match op {
                opcode::STOP | opcode::RETURN | opcode::REVERT => 0,
                opcode::ADD | opcode::PUSH1..=opcode::PUSH32 => 3,
                opcode::POP | opcode::GAS => 2,
                opcode::JUMPI => 10,
                opcode::JUMPDEST => 1,
                opcode::SLOAD => SLOAD_GAS,
                opcode::SSTORE => {
                    let (Some(slot), Some(value)) = (peek(&stack, 0), peek(&stack, 1)) else {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    };
                    let current = self
                        .state
                        .storage(address, H256::from_uint(&slot))
                        .await?
                        .into_uint();
                    if current == value {
                        WARM_ACCESS_GAS
                    } else if current.is_zero() {
                        SSTORE_SET_GAS
                    } else {
                        SSTORE_RESET_GAS
                    }
                }
                opcode::LOG0..=opcode::LOG4 => LOG_GAS * (1 + u64::from(op - opcode::LOG0)),
                opcode::CALL => {
                    let Some(value) = peek(&stack, 2) else {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    };
                    if value.is_zero() {
                        WARM_ACCESS_GAS
                    } else {
                        WARM_ACCESS_GAS + CALL_VALUE_GAS
                    }
                }
                other => {
                    self.trace(pc, other, depth, gas, 0, &stack, address);
                    return Ok(Outcome::halt(HaltReason::InvalidOpcode(other)));
                }
            };
            self.trace(pc, op, depth, gas, cost, &stack, address);
            if gas < cost {
                return Ok(Outcome::halt(HaltReason::OutOfGas));
            }
            gas -= cost;
            pc += 1;

            match op {
                opcode::STOP | opcode::RETURN => {
                    return Ok(Outcome {
                        status: ExecutionStatus::Success,
                        gas_left: gas,
                    })
                }
                opcode::REVERT => {
                    return Ok(Outcome {
                        status: ExecutionStatus::Revert,
                        gas_left: gas,
                    })
                }
                opcode::PUSH1..=opcode::PUSH32 => {
                    let size = usize::from(op - opcode::PUSH1) + 1;
                    let end = (pc + size).min(code.len());
                    let mut word = [0u8; 32];
                    let bytes = &code[pc.min(end)..end];
                    word[32 - size..32 - size + bytes.len()].copy_from_slice(bytes);
                    stack.push(U256::from_big_endian(&word));
                    pc += size;
                }
                opcode::ADD => {
                    let (Some(a), Some(b)) = (stack.pop(), stack.pop()) else {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    };
                    stack.push(a.overflowing_add(b).0);
                }
                opcode::POP => {
                    if stack.pop().is_none() {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    }
                }
                opcode::GAS => stack.push(gas.into()),
                opcode::JUMPDEST => {}
                opcode::JUMPI => {
                    let (Some(dest), Some(condition)) = (stack.pop(), stack.pop()) else {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    };
                    if !condition.is_zero() {
                        pc = dest.low_u64() as usize;
                        if code.get(pc) != Some(&opcode::JUMPDEST) {
                            return Ok(Outcome::halt(HaltReason::Other("bad jump".into())));
                        }
                    }
                }
                opcode::SLOAD => {
                    let Some(slot) = stack.pop() else {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    };
                    let value = self.state.storage(address, H256::from_uint(&slot)).await?;
                    stack.push(value.into_uint());
                }
                opcode::SSTORE => {
                    let (Some(slot), Some(value)) = (stack.pop(), stack.pop()) else {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    };
                    let slot = H256::from_uint(&slot);
                    let current = self.state.storage(address, slot).await?;
                    if !current.is_zero() && value.is_zero() {
                        self.refund += SSTORE_CLEARS_REFUND;
                    }
                    self.state
                        .set_storage(address, slot, H256::from_uint(&value))
                        .await?;
                }
                opcode::LOG0..=opcode::LOG4 => {
                    let topics = usize::from(op - opcode::LOG0);
                    if stack.len() < topics + 2 {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    }
                    stack.truncate(stack.len() - 2);
                    let topics = stack
                        .split_off(stack.len() - topics)
                        .into_iter()
                        .rev()
                        .map(|topic| H256::from_uint(&topic))
                        .collect();
                    self.logs.push(Log {
                        address,
                        topics,
                        data: Vec::new(),
                    });
                }
                opcode::CALL => {
                    if stack.len() < 7 {
                        return Ok(Outcome::halt(HaltReason::StackUnderflow));
                    }
                    let args = stack.split_off(stack.len() - 7);
                    let requested = args[6].min(u64::MAX.into()).low_u64();
                    let target = Address::from(H256::from_uint(&args[5]));
                    let value = args[4];

                    let forwarded = requested.min(gas - gas / 64);
                    gas -= forwarded;
                    let stipend = if value.is_zero() { 0 } else { CALL_STIPEND };
                    let child = self
                        .call(address, target, value, forwarded + stipend, depth + 1)
                        .await?;
                    gas += child.gas_left;
                    let success = child.status == ExecutionStatus::Success;
                    stack.push(U256::from(u8::from(success)));
                }
                _ => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn trace(
        &mut self,
        pc: usize,
        op: u8,
        depth: u64,
        gas: u64,
        gas_cost: u64,
        stack: &[U256],
        address: Address,
    ) {
        if let Some(tracer) = &mut self.tracer {
            tracer.step(&Step {
                pc: pc as u64,
                op,
                depth,
                gas,
                gas_cost,
                stack: stack.to_vec(),
                address,
            });
        }
    }
}

/// The `n`th stack item from the top.
fn peek(stack: &[U256], n: usize) -> Option<U256> {
    stack.len().checked_sub(n + 1).map(|index| stack[index])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToyVm;

#[async_trait]
impl Executor for ToyVm {
    async fn execute(
        &self,
        tx: &Transaction,
        block: &BlockContext,
        state: &mut StateDb,
        tracer: Option<&mut dyn StepTracer>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let price = buy_gas(tx, block, state).await?;
        let available = tx.gas_limit.saturating_sub(tx.intrinsic_gas());

        let mut vm = Interpreter {
            state: &mut *state,
            tracer,
            logs: Vec::new(),
            refund: 0,
        };
        let (outcome, created_address) = match tx.to {
            Some(to) => (vm.call(tx.from, to, tx.value, available, 1).await?, None),
            None => {
                let created = create_address(tx.from, tx.nonce);
                transfer(vm.state, tx.from, created, tx.value).await?;
                vm.state.set_code(created, tx.data.clone()).await?;
                let outcome = Outcome {
                    status: ExecutionStatus::Success,
                    gas_left: available,
                };
                (outcome, Some(created))
            }
        };
        let success = outcome.status == ExecutionStatus::Success;
        let used = tx.gas_limit - outcome.gas_left;
        let refund = if success { vm.refund.min(used / 5) } else { 0 };
        let logs = if success { vm.logs } else { Vec::new() };

        let gas_used = used - refund;
        settle_gas(tx, block, state, gas_used, price).await?;
        Ok(ExecutionResult {
            status: outcome.status,
            gas_used,
            gas_refund: refund,
            logs,
            created_address: created_address.filter(|_| success),
            return_data: Vec::new(),
        })
    }
}

/// Code that stores `value` in `slot` and stops.
pub fn store(slot: u8, value: u8) -> Vec<u8> {
    vec![
        opcode::PUSH1,
        value,
        opcode::PUSH1,
        slot,
        opcode::SSTORE,
        opcode::STOP,
    ]
}

/// Code that calls `target` with all the gas it can forward and reverts if
/// the call fails.
pub fn call(target: Address) -> Vec<u8> {
    let mut code = Vec::new();
    for _ in 0..5 {
        code.extend([opcode::PUSH1, 0]);
    }
    code.push(opcode::PUSH20);
    code.extend(target.as_bytes());
    code.extend([opcode::GAS, opcode::CALL]);
    let ok = code.len() as u8 + 4;
    code.extend([opcode::PUSH1, ok, opcode::JUMPI, opcode::REVERT, opcode::JUMPDEST, opcode::STOP]);
    code
}

/// Code that emits a log with one topic.
pub fn log(topic: u8) -> Vec<u8> {
    vec![
        opcode::PUSH1,
        topic,
        opcode::PUSH1,
        0,
        opcode::PUSH1,
        0,
        opcode::LOG1,
        opcode::STOP,
    ]
}

pub fn genesis() -> Vec<GenesisAccount> {
    [ALICE, BOB, CAROL]
        .into_iter()
        .map(|address| GenesisAccount {
            address,
            balance: eth_to_wei(1000.into()),
        })
        .collect()
}

/// A config whose interval never elapses during a test, so blocks are
/// only mined on request.
pub fn manual() -> ChainConfig {
    ChainConfig::default().with_mining(MiningMode::Interval(Duration::from_secs(3_600)))
}

pub async fn chain_with(config: ChainConfig, fork: Option<Arc<ForkClient>>) -> Blockchain {
    let db = Arc::new(ChainDb::new(Arc::new(MemoryStore::new()), TrieDb::new(), fork));
    let chain = Blockchain::new(config, Arc::new(ToyVm), db);
    chain.initialize(&genesis()).await.unwrap();
    chain
}

/// A local chain running `executor` instead of [`ToyVm`].
pub async fn chain_executing(config: ChainConfig, executor: Arc<dyn Executor>) -> Blockchain {
    let db = Arc::new(ChainDb::new(Arc::new(MemoryStore::new()), TrieDb::new(), None));
    let chain = Blockchain::new(config, executor, db);
    chain.initialize(&genesis()).await.unwrap();
    chain
}

pub async fn chain(config: ChainConfig) -> Blockchain {
    chain_with(config, None).await
}

pub fn transfer_to(from: Address, to: Address, value: u64) -> TransactionRequest {
    TransactionRequest {
        from,
        to: Some(to),
        value: value.into(),
        gas_limit: Some(21_000),
        ..Default::default()
    }
}

pub fn deploy(from: Address, code: Vec<u8>) -> TransactionRequest {
    TransactionRequest {
        from,
        data: code,
        gas_limit: Some(200_000),
        ..Default::default()
    }
}

/// Deploys `code` from `from` and returns the contract address.
pub async fn deployed(chain: &Blockchain, from: Address, code: Vec<u8>) -> Address {
    let hash = chain.queue_transaction(deploy(from, code), None).await.unwrap();
    chain
        .receipt(hash)
        .await
        .unwrap()
        .and_then(|receipt| receipt.contract_address)
        .unwrap()
}
