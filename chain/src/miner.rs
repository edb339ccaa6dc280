//! Block assembly.
//!
//! Executables are picked across origins by effective gas price, each
//! origin contributing its lowest nonce at a time, and executed on the live
//! state inside a checkpoint that is committed only if the result fits the
//! block.

use std::sync::Arc;

use ethereum_types::{Address, BigEndianHash as _, H256, U256};
use keccak_hash::keccak;
use parking_lot::Mutex;
use simchain_common::gas::TX_GAS;
use simchain_state::block::{Block, Header};
use simchain_state::managers::ChainDb;
use simchain_state::receipt::{logs_bloom, BlockLogs, Receipt, ReceiptRecord};
use simchain_state::state_db::StateDb;
use simchain_state::trie::{ReceiptTrie, TransactionTrie};
use tokio::sync::{Notify, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::config::{next_base_fee, ChainConfig};
use crate::events::StorageKeys;
use crate::executor::{opcode, BlockContext, ExecutionResult, Executor, Step, StepTracer};
use crate::heap::Heap;
use crate::time::TimeManager;
use crate::txpool::{PooledTransaction, RejectReason, TxPool};
use crate::writer::{BlockWriter, MinedBlock};
use crate::ChainError;

/// Builds the header of the next block from its parent.
pub struct BlockFactory {
    chain_id: u64,
    gas_limit: u64,
    coinbase: Address,
    initial_base_fee: U256,
    time: Arc<TimeManager>,
}

impl BlockFactory {
    pub fn new(config: &ChainConfig, time: Arc<TimeManager>) -> Self {
        Self {
            chain_id: config.chain_id,
            gas_limit: config.block_gas_limit,
            coinbase: config.coinbase,
            initial_base_fee: config.initial_base_fee,
            time,
        }
    }

    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Header of the block after `parent`, roots and gas used unset.
    pub fn next_header(&self, parent: &Block, timestamp: Option<u64>) -> Header {
        let parent_header = &parent.header;
        let base_fee = match parent_header.base_fee_per_gas {
            Some(base_fee) => next_base_fee(
                base_fee,
                parent_header.gas_used,
                parent_header.gas_limit,
            ),
            None => self.initial_base_fee,
        };
        Header {
            parent_hash: parent.hash(),
            coinbase: self.coinbase,
            number: parent.number() + 1,
            gas_limit: self.gas_limit,
            timestamp: self
                .time
                .next_timestamp(parent_header.timestamp, timestamp),
            base_fee_per_gas: Some(base_fee),
            ..Default::default()
        }
    }
}

/// Records the raw slots read or written by `SLOAD`/`SSTORE`.
#[derive(Debug, Default)]
pub struct StorageKeyTracer {
    pub keys: StorageKeys,
}

impl StepTracer for StorageKeyTracer {
    fn step(&mut self, step: &Step) {
        if matches!(step.op, opcode::SLOAD | opcode::SSTORE) {
            if let Some(slot) = step.stack.last() {
                let raw = H256::from_uint(slot);
                self.keys.insert(keccak(raw), raw);
            }
        }
    }
}

/// An origin's best transaction competing for the next slot in a block.
struct Candidate {
    price: U256,
    tx: Arc<PooledTransaction>,
}

impl Candidate {
    fn new(tx: Arc<PooledTransaction>, base_fee: Option<U256>) -> Self {
        Self {
            price: tx.transaction.fee.effective_gas_price(base_fee),
            tx,
        }
    }
}

/// Highest effective price first, earliest admission on ties.
fn highest_price_first(a: &Candidate, b: &Candidate) -> bool {
    (a.price, std::cmp::Reverse(a.tx.id)) > (b.price, std::cmp::Reverse(b.tx.id))
}

/// Candidates locked for the block under assembly. Those left over are
/// unlocked on drop, however the assembly ends.
struct Candidates(Heap<Candidate>);

impl Candidates {
    fn new() -> Self {
        Self(Heap::new(highest_price_first))
    }
}

impl std::ops::Deref for Candidates {
    type Target = Heap<Candidate>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for Candidates {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for Candidates {
    fn drop(&mut self) {
        for left in self.0.drain() {
            left.tx.unlock();
        }
    }
}

fn affordable(tx: &PooledTransaction, base_fee: Option<U256>) -> bool {
    base_fee.map_or(true, |base_fee| tx.transaction.fee.max_fee() >= base_fee)
}

#[derive(Debug, Default)]
struct Activity {
    busy: bool,
    /// A request arrived while busy.
    pending: bool,
}

/// Transactions of a block under assembly with their results.
type Executed = Vec<(Arc<PooledTransaction>, ExecutionResult)>;

pub struct Miner {
    pool: Arc<TxPool>,
    executor: Arc<dyn Executor>,
    state: Arc<tokio::sync::Mutex<StateDb>>,
    db: Arc<ChainDb>,
    writer: Arc<BlockWriter>,
    factory: BlockFactory,
    activity: Mutex<Activity>,
    idle: Notify,
    gate: Arc<RwLock<()>>,
    /// Serializes pauses, so only one of them waits for the gate.
    pausing: tokio::sync::Mutex<()>,
    paused: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl Miner {
    pub fn new(
        pool: Arc<TxPool>,
        executor: Arc<dyn Executor>,
        state: Arc<tokio::sync::Mutex<StateDb>>,
        db: Arc<ChainDb>,
        writer: Arc<BlockWriter>,
        factory: BlockFactory,
    ) -> Self {
        Self {
            pool,
            executor,
            state,
            db,
            writer,
            factory,
            activity: Mutex::new(Activity::default()),
            idle: Notify::new(),
            gate: Arc::new(RwLock::new(())),
            pausing: tokio::sync::Mutex::new(()),
            paused: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.activity.lock().busy
    }

    /// Mines at least one block and returns the blocks produced once they
    /// are persisted.
    ///
    /// While another assembly runs the request is folded into it: one more
    /// block is mined by the running call and this one returns no blocks.
    pub async fn mine(
        &self,
        max_transactions: Option<usize>,
        only_one_block: bool,
        timestamp: Option<u64>,
    ) -> Result<Vec<Block>, ChainError> {
        let idle = self.idle.notified();
        tokio::pin!(idle);
        idle.as_mut().enable();
        let folded = {
            let mut activity = self.activity.lock();
            activity.pending |= activity.busy;
            std::mem::replace(&mut activity.busy, true)
        };
        if folded {
            idle.await;
            return Ok(Vec::new());
        }

        let mined = self
            .mine_while_busy(max_transactions, only_one_block, timestamp)
            .await;
        if mined.is_err() {
            *self.activity.lock() = Activity::default();
        }
        self.idle.notify_waiters();
        mined
    }

    async fn mine_while_busy(
        &self,
        max_transactions: Option<usize>,
        only_one_block: bool,
        mut timestamp: Option<u64>,
    ) -> Result<Vec<Block>, ChainError> {
        let _open = self.gate.read().await;
        let mut blocks = Vec::new();
        loop {
            let parent = self.db.blocks.latest()?.ok_or(ChainError::NotStarted)?;
            let header = self.factory.next_header(&parent, timestamp.take());
            let mut executed = Executed::new();
            let saved = match self.assemble(header, max_transactions, &mut executed).await {
                Ok(mined) => self.writer.save(mined).await,
                Err(err) => Err(err),
            };
            let block = match saved {
                Ok(block) => block,
                Err(err) => {
                    self.abandon(&parent, &executed, &err).await;
                    return Err(err);
                }
            };
            for (tx, result) in &executed {
                self.pool
                    .confirm(tx, block.number(), block.hash(), result.error());
            }
            blocks.push(block);

            let more = !only_one_block && !executed.is_empty() && self.pool.has_executables();
            let done = {
                let mut activity = self.activity.lock();
                // Cleared under the lock waiters check `busy` with.
                let done = !activity.pending && !more;
                activity.pending = false;
                activity.busy = !done;
                done
            };
            if done {
                break;
            }
        }
        Ok(blocks)
    }

    /// Rolls the live state back to `parent` after a block failed to be
    /// assembled or persisted, and rejects the transactions already taken
    /// for it.
    async fn abandon(&self, parent: &Block, executed: &Executed, err: &ChainError) {
        let reset = self
            .state
            .lock()
            .await
            .set_root(parent.header.state_root, Some(parent.number()));
        if let Err(reset) = reset {
            warn!(%reset, "could not reset the state to the parent block");
        }
        warn!(%err, taken = executed.len(), "block abandoned");
        for (tx, _) in executed {
            self.pool.reject(
                tx,
                RejectReason::Execution(format!("block {} not mined: {err}", parent.number() + 1)),
            );
        }
    }

    /// Fills the block described by `header` from the pool and executes it
    /// on the live state. Included transactions are pushed to `executed` as
    /// they are taken from the pool.
    async fn assemble(
        &self,
        mut header: Header,
        max_transactions: Option<usize>,
        executed: &mut Executed,
    ) -> Result<MinedBlock, ChainError> {
        let ctx = BlockContext::from_header(&header, self.factory.chain_id());
        let base_fee = header.base_fee_per_gas;
        let mut state = self.state.lock().await;

        let mut priced = Candidates::new();
        for tx in self.pool.origins_with_work() {
            // Fee caps below the base fee wait for a cheaper block.
            if affordable(&tx, base_fee) && tx.lock() {
                priced.push(Candidate::new(tx, base_fee));
            }
        }

        let mut gas_left = header.gas_limit;
        let mut storage_keys = StorageKeys::new();
        while let Some(best) = priced.peek() {
            if gas_left < TX_GAS || max_transactions.is_some_and(|max| executed.len() >= max) {
                break;
            }
            let tx = best.tx.clone();
            if tx.transaction.intrinsic_gas() > gas_left {
                // Later nonces of this origin cannot be mined before it.
                priced.pop();
                tx.unlock();
                continue;
            }

            state.checkpoint();
            let mut keys = StorageKeyTracer::default();
            let outcome = self
                .executor
                .execute(
                    &tx.transaction,
                    &ctx,
                    &mut state,
                    Some(&mut keys as &mut dyn StepTracer),
                )
                .await;
            match outcome {
                Err(err) => {
                    state.revert()?;
                    priced.pop();
                    self.pool
                        .reject(&tx, RejectReason::Execution(err.to_string()));
                }
                Ok(result) if result.gas_used > gas_left => {
                    state.revert()?;
                    priced.pop();
                    tx.unlock();
                    debug!(hash = ?tx.hash(), gas_used = result.gas_used, gas_left, "transaction does not fit");
                }
                Ok(result) => {
                    state.commit()?;
                    gas_left -= result.gas_used;
                    self.pool.take(&tx);
                    storage_keys.extend(keys.keys);
                    match self.pool.best_for(tx.from()) {
                        Some(next) if affordable(&next, base_fee) && next.lock() => {
                            priced.replace_best(Candidate::new(next, base_fee));
                        }
                        _ => {
                            priced.pop();
                        }
                    }
                    executed.push((tx, result));
                }
            }
        }
        drop(priced);

        header.state_root = state.flush().await?;
        drop(state);

        let mut transactions_trie = TransactionTrie::new();
        let mut receipts_trie = ReceiptTrie::new();
        let mut receipts = Vec::with_capacity(executed.len());
        let mut cumulative_gas_used = 0;
        for (index, (tx, result)) in executed.iter().enumerate() {
            cumulative_gas_used += result.gas_used;
            let receipt = Receipt::new(
                tx.transaction.tx_type(),
                result.is_success(),
                cumulative_gas_used,
                result.logs.clone(),
            );
            transactions_trie.insert(index, tx.transaction.raw())?;
            receipts_trie.insert(index, receipt.encode())?;
            receipts.push(receipt);
        }
        header.transactions_root = transactions_trie.root();
        header.receipts_root = receipts_trie.root();
        header.logs_bloom = logs_bloom(executed.iter().flat_map(|(_, result)| &result.logs));
        header.gas_used = cumulative_gas_used;

        let block = Block::new(
            header,
            executed
                .iter()
                .map(|(tx, _)| tx.transaction.clone())
                .collect(),
        );
        let mut logs = BlockLogs::new(block.number(), block.hash());
        let receipts = receipts
            .into_iter()
            .zip(executed.iter())
            .enumerate()
            .map(|(index, (receipt, (tx, result)))| {
                for log in &result.logs {
                    logs.append(tx.hash(), index as u64, log.clone());
                }
                ReceiptRecord {
                    receipt,
                    transaction_hash: tx.hash(),
                    transaction_index: index as u64,
                    block_hash: block.hash(),
                    block_number: block.number(),
                    from: tx.from(),
                    to: tx.transaction.to,
                    gas_used: result.gas_used,
                    effective_gas_price: tx.transaction.fee.effective_gas_price(base_fee),
                    contract_address: result.created_address,
                }
            })
            .collect();

        if let Some(failed) = executed.iter().find(|(_, result)| !result.is_success()) {
            warn!(hash = ?failed.0.hash(), error = ?failed.1.error(), "transaction failed in block");
        }

        Ok(MinedBlock {
            block,
            receipts,
            logs,
            storage_keys,
        })
    }

    /// Waits for the assembly in flight and holds new ones.
    pub async fn pause(&self) {
        let _pausing = self.pausing.lock().await;
        if self.paused.lock().is_some() {
            return;
        }
        let closed = self.gate.clone().write_owned().await;
        *self.paused.lock() = Some(closed);
    }

    pub fn resume(&self) {
        self.paused.lock().take();
    }
}
