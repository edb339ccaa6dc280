//! The chain orchestrator.
//!
//! [`Blockchain`] owns the live state, the pool, the miner and the block
//! writer, wires them to the configured mining policy, and answers state and
//! record queries as of any block.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use parking_lot::Mutex;
use simchain_common::EMPTY_TRIE_HASH;
use simchain_state::block::{Block, Header, TransactionRecord};
use simchain_state::managers::{BlockTag, ChainDb};
use simchain_state::receipt::{BlockLogs, Log, LogEntry, LogFilter, ReceiptRecord};
use simchain_state::state_db::StateDb;
use simchain_state::transaction::{Fee, Transaction, TransactionRequest, UnsignedTransaction};
use simchain_state::StateError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ChainConfig, MiningMode};
use crate::estimator;
use crate::events::{BlockEvent, Events, Lifecycle};
use crate::executor::{
    revert_reason, BlockContext, ExecutionStatus, Executor, StepTracer, StructLog, StructLogger,
};
use crate::miner::{BlockFactory, Miner};
use crate::time::{Moment, TimeManager};
use crate::txpool::{Finality, NonceSource, PoolConfig, Signer, TxPool};
use crate::writer::BlockWriter;
use crate::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Starting,
    Started,
    Paused,
    Stopping,
    Stopped,
}

/// An account funded in the genesis block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    number: u64,
    hash: H256,
    time: Moment,
}

/// Replacement account fields for a simulated call. `state` replaces the
/// whole storage, `state_diff` patches single slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountOverride {
    pub balance: Option<U256>,
    pub nonce: Option<u64>,
    pub code: Option<Vec<u8>>,
    pub state: Option<BTreeMap<H256, H256>>,
    pub state_diff: Option<BTreeMap<H256, H256>>,
}

pub type StateOverrides = BTreeMap<Address, AccountOverride>;

/// Outcome of a successful simulated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub return_data: Vec<u8>,
    pub gas_used: u64,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionLookup {
    Mined(TransactionRecord),
    /// Still in the pool.
    Pending(Transaction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    /// The slot, when its preimage is known.
    pub key: Option<H256>,
    pub value: H256,
}

/// A page of an account's storage, keyed by hashed slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageRange {
    pub storage: BTreeMap<H256, StorageEntry>,
    /// First hashed slot of the next page.
    pub next_key: Option<H256>,
}

/// Nonces as of the latest persisted block.
struct LatestNonces {
    db: Arc<ChainDb>,
}

#[async_trait]
impl NonceSource for LatestNonces {
    async fn nonce(&self, address: Address) -> Result<u64, StateError> {
        match self.db.blocks.latest()? {
            Some(latest) => self.db.accounts.nonce(address, &latest.header).await,
            None => Ok(0),
        }
    }
}

pub struct Blockchain {
    config: ChainConfig,
    db: Arc<ChainDb>,
    executor: Arc<dyn Executor>,
    events: Events,
    pool: Arc<TxPool>,
    miner: Arc<Miner>,
    writer: Arc<BlockWriter>,
    time: Arc<TimeManager>,
    state: Arc<tokio::sync::Mutex<StateDb>>,
    snapshots: Mutex<Vec<Snapshot>>,
    status: watch::Sender<Status>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Blockchain {
    /// Wires the components together. Nothing runs before
    /// [`Blockchain::initialize`].
    pub fn new(config: ChainConfig, executor: Arc<dyn Executor>, db: Arc<ChainDb>) -> Self {
        let events = Events::default();
        let time = Arc::new(TimeManager::new(config.time_increment));
        let state = Arc::new(tokio::sync::Mutex::new(StateDb::new(
            db.accounts.trie_db().clone(),
            db.accounts.fetcher(),
        )));
        let pool = Arc::new(TxPool::new(
            PoolConfig::from(&config),
            Arc::new(LatestNonces { db: db.clone() }),
        ));
        let writer = Arc::new(BlockWriter::new(db.clone(), events.clone()));
        let miner = Arc::new(Miner::new(
            pool.clone(),
            executor.clone(),
            state.clone(),
            db.clone(),
            writer.clone(),
            BlockFactory::new(&config, time.clone()),
        ));
        Self {
            config,
            db,
            executor,
            events,
            pool,
            miner,
            writer,
            time,
            state,
            snapshots: Mutex::new(Vec::new()),
            status: watch::channel(Status::Starting).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub const fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn pool(&self) -> &Arc<TxPool> {
        &self.pool
    }

    pub fn db(&self) -> &Arc<ChainDb> {
        &self.db
    }

    /// Opens the store, loads the latest block or creates the genesis block
    /// funding `genesis`, and starts mining. A failure leaves the store
    /// closed.
    pub async fn initialize(&self, genesis: &[GenesisAccount]) -> Result<(), ChainError> {
        match self.start(genesis).await {
            Ok(latest) => {
                self.status.send_replace(Status::Started);
                info!(number = latest.number(), hash = ?latest.hash(), "blockchain ready");
                self.events.lifecycle(Lifecycle::Ready);
                Ok(())
            }
            Err(err) => {
                if let Err(close) = self.db.close() {
                    warn!(%close, "closing the store after a failed start");
                }
                self.status.send_replace(Status::Stopped);
                Err(err)
            }
        }
    }

    async fn start(&self, genesis: &[GenesisAccount]) -> Result<Block, ChainError> {
        self.db.open()?;
        let latest = match self.db.blocks.latest()? {
            Some(latest) => latest,
            None => self.create_genesis(genesis).await?,
        };
        self.state
            .lock()
            .await
            .set_root(latest.header.state_root, Some(latest.number()))?;
        self.time.start(latest.header.timestamp);
        self.spawn_mining();
        Ok(latest)
    }

    async fn create_genesis(&self, accounts: &[GenesisAccount]) -> Result<Block, ChainError> {
        let now = self.config.start_time.unwrap_or_else(|| self.time.adjusted());
        let mut header = Header {
            coinbase: self.config.coinbase,
            gas_limit: self.config.block_gas_limit,
            timestamp: now,
            base_fee_per_gas: Some(self.config.initial_base_fee),
            ..Default::default()
        };
        if let Some(fork) = self.db.fork() {
            let pin = fork.pin();
            header.number = pin.number + 1;
            header.parent_hash = pin.hash;
            header.timestamp = now.max(pin.timestamp + 1);
            if let Some(base_fee) = pin.base_fee_per_gas {
                header.base_fee_per_gas = Some(base_fee);
            }
        }

        let mut state = StateDb::at(
            self.db.accounts.trie_db().clone(),
            self.db.accounts.fetcher(),
            EMPTY_TRIE_HASH,
            Some(header.number),
        )?;
        for account in accounts {
            state.set_balance(account.address, account.balance).await?;
        }
        header.state_root = state.flush().await?;

        let genesis = Block::new(header, Vec::new());
        self.db.write_block(
            &genesis,
            &[],
            &BlockLogs::new(genesis.number(), genesis.hash()),
        )?;
        info!(
            number = genesis.number(),
            hash = ?genesis.hash(),
            accounts = accounts.len(),
            forked = self.db.fork().is_some(),
            "created genesis block"
        );
        Ok(genesis)
    }

    fn spawn_mining(&self) {
        let miner = self.miner.clone();
        let task = match self.config.mining {
            MiningMode::Instamine(_) => {
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    loop {
                        pool.work_available().await;
                        if let Err(err) = miner.mine(Some(1), false, None).await {
                            warn!(%err, "instamine failed");
                        }
                    }
                })
            }
            MiningMode::Interval(period) => tokio::spawn(async move {
                let mut ticks =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticks.tick().await;
                    if let Err(err) = miner.mine(None, true, None).await {
                        warn!(%err, "interval mining failed");
                    }
                }
            }),
        };
        self.tasks.lock().push(task);
    }

    fn ensure_started(&self) -> Result<(), ChainError> {
        match self.status() {
            Status::Started | Status::Paused => Ok(()),
            _ => Err(ChainError::NotStarted),
        }
    }

    /// Mines blocks now and returns them once persisted. A request arriving
    /// while a block is being assembled is served by that assembly and
    /// returns the latest block.
    pub async fn mine(
        &self,
        max_transactions: Option<usize>,
        only_one_block: bool,
        timestamp: Option<u64>,
    ) -> Result<Vec<Block>, ChainError> {
        self.ensure_started()?;
        let blocks = self
            .miner
            .mine(max_transactions, only_one_block, timestamp)
            .await?;
        if !blocks.is_empty() {
            return Ok(blocks);
        }
        Ok(self.db.blocks.latest()?.into_iter().collect())
    }

    /// Records the current head. Ids are the depth of the snapshot stack.
    pub fn snapshot(&self) -> Result<u64, ChainError> {
        let latest = self.latest()?;
        let mut snapshots = self.snapshots.lock();
        snapshots.push(Snapshot {
            number: latest.number(),
            hash: latest.hash(),
            time: self.time.moment(),
        });
        let id = snapshots.len() as u64;
        debug!(id, number = latest.number(), "snapshot taken");
        Ok(id)
    }

    /// Rewinds the chain to snapshot `id`, discarding it and every later
    /// snapshot, every queued transaction and every block after it. Returns
    /// false for an unknown id.
    pub async fn revert(&self, id: u64) -> Result<bool, ChainError> {
        let snapshot = {
            let mut snapshots = self.snapshots.lock();
            let Ok(depth) = usize::try_from(id) else {
                return Ok(false);
            };
            if depth == 0 || depth > snapshots.len() {
                return Ok(false);
            }
            snapshots.truncate(depth);
            snapshots.pop()
        };
        let Some(snapshot) = snapshot else {
            return Ok(false);
        };

        self.pool.pause().await;
        self.miner.pause().await;
        let rewound = self.rewind(&snapshot).await;
        if self.status() == Status::Started {
            self.miner.resume();
        }
        self.pool.resume();
        rewound?;
        info!(id, number = snapshot.number, hash = ?snapshot.hash, "reverted to snapshot");
        Ok(true)
    }

    async fn rewind(&self, snapshot: &Snapshot) -> Result<(), ChainError> {
        self.writer.settled().await;
        self.pool.clear();
        let target = self
            .db
            .blocks
            .local(snapshot.number)?
            .ok_or(ChainError::UnknownBlock)?;
        let removed = self.db.delete_after(snapshot.number)?;
        debug!(removed = removed.len(), "deleted blocks after snapshot");
        self.state
            .lock()
            .await
            .set_root(target.header.state_root, Some(target.number()))?;
        self.time.restore(snapshot.time);
        Ok(())
    }

    /// Admits a transaction and returns its hash. With eager instamining the
    /// call returns once the transaction is mined.
    pub async fn queue_transaction(
        &self,
        request: TransactionRequest,
        signer: Option<&dyn Signer>,
    ) -> Result<H256, ChainError> {
        self.ensure_started()?;
        let admitted = self.pool.prepare(request, signer).await?;
        let tx = admitted.transaction;
        self.events.pending_transaction(tx.transaction.clone());
        if !admitted.executable {
            return Ok(tx.hash());
        }
        self.pool.drain();
        if !self.config.is_eager() {
            return Ok(tx.hash());
        }
        match tx.finalized().await {
            Finality::Rejected(reason) => Err(ChainError::Rejected { reason }),
            Finality::Confirmed {
                error: Some(reason),
                ..
            } if self.config.vm_error_on_transaction_failure => Err(ChainError::TransactionFailed {
                hash: tx.hash(),
                reason,
            }),
            _ => Ok(tx.hash()),
        }
    }

    /// Runs a transaction on the state after `tag` without keeping any of
    /// its effects.
    pub async fn simulate_transaction(
        &self,
        request: TransactionRequest,
        tag: BlockTag,
        overrides: &StateOverrides,
    ) -> Result<CallResult, ChainError> {
        let block = self.block_for(tag).await?;
        let mut state = self.db.accounts.state_at(&block.header)?;
        apply_overrides(&mut state, overrides).await?;
        let tx = self.call_transaction(request, &state, &block.header).await?;
        let result = self
            .executor
            .execute(&tx, &self.call_context(&block.header), &mut state, None)
            .await?;
        match result.status {
            ExecutionStatus::Success => Ok(CallResult {
                return_data: result.return_data,
                gas_used: result.gas_used,
                logs: result.logs,
            }),
            ExecutionStatus::Revert => Err(ChainError::CallError {
                reason: revert_reason(&result.return_data),
                data: result.return_data,
            }),
            ExecutionStatus::Halt(reason) => Err(ChainError::CallError {
                reason: reason.to_string(),
                data: Vec::new(),
            }),
        }
    }

    pub async fn estimate_gas(
        &self,
        request: TransactionRequest,
        tag: BlockTag,
    ) -> Result<u64, ChainError> {
        let block = self.block_for(tag).await?;
        let state = self.db.accounts.state_at(&block.header)?;
        let tx = self.call_transaction(request, &state, &block.header).await?;
        let mut ctx = self.call_context(&block.header);
        ctx.gas_limit = self.config.block_gas_limit;
        estimator::estimate_gas(&*self.executor, &tx, &ctx, &state).await
    }

    /// Fills in a request for read-only execution: the sender's current
    /// nonce, a zero price and the block gas limit unless given.
    async fn call_transaction(
        &self,
        request: TransactionRequest,
        state: &StateDb,
        header: &Header,
    ) -> Result<Transaction, ChainError> {
        let nonce = match request.nonce {
            Some(nonce) => nonce,
            None => state.nonce(request.from).await?,
        };
        let unsigned = UnsignedTransaction {
            from: request.from,
            nonce,
            fee: request.fee.unwrap_or(Fee::Legacy {
                gas_price: U256::zero(),
            }),
            gas_limit: request.gas_limit.unwrap_or(header.gas_limit),
            to: request.to,
            value: request.value,
            data: request.data,
            chain_id: self.config.chain_id,
        };
        let signature = unsigned.fake_signature();
        Ok(unsigned.into_signed(signature))
    }

    /// Context of read-only execution on top of `header`: no base fee.
    fn call_context(&self, header: &Header) -> BlockContext {
        BlockContext {
            base_fee: None,
            ..BlockContext::from_header(header, self.config.chain_id)
        }
    }

    /// Moves time forward. Returns the total offset.
    pub fn increase_time(&self, seconds: u64) -> i64 {
        let offset = self.time.increase(seconds);
        info!(seconds, offset, "increased time");
        offset
    }

    /// Sets the current time. Returns the resulting offset.
    pub fn set_time(&self, timestamp: u64) -> i64 {
        let offset = self.time.set_time(timestamp);
        info!(timestamp, offset, "set time");
        offset
    }

    fn latest(&self) -> Result<Block, ChainError> {
        self.db.blocks.latest()?.ok_or(ChainError::NotStarted)
    }

    async fn block_for(&self, tag: BlockTag) -> Result<Block, ChainError> {
        self.db
            .blocks
            .by_tag(tag)
            .await?
            .ok_or(ChainError::UnknownBlock)
    }

    pub fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.latest()?.number())
    }

    pub async fn block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, ChainError> {
        Ok(self.db.blocks.by_tag(tag).await?)
    }

    pub async fn block_by_hash(&self, hash: H256) -> Result<Option<Block>, ChainError> {
        Ok(self.db.blocks.get_by_hash(hash).await?)
    }

    pub async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionLookup>, ChainError> {
        if let Some(record) = self.db.transactions.get(hash).await? {
            return Ok(Some(TransactionLookup::Mined(record)));
        }
        Ok(self
            .pool
            .find(hash)
            .map(|tx| TransactionLookup::Pending(tx.transaction.clone())))
    }

    pub async fn receipt(&self, hash: H256) -> Result<Option<ReceiptRecord>, ChainError> {
        Ok(self.db.receipts.get(hash).await?)
    }

    pub async fn balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError> {
        let block = self.block_for(tag).await?;
        Ok(self.db.accounts.balance(address, &block.header).await?)
    }

    pub async fn nonce(&self, address: Address, tag: BlockTag) -> Result<u64, ChainError> {
        let block = self.block_for(tag).await?;
        Ok(self.db.accounts.nonce(address, &block.header).await?)
    }

    pub async fn code(&self, address: Address, tag: BlockTag) -> Result<Vec<u8>, ChainError> {
        let block = self.block_for(tag).await?;
        Ok(self.db.accounts.code(address, &block.header).await?)
    }

    pub async fn storage_at(
        &self,
        address: Address,
        slot: H256,
        tag: BlockTag,
    ) -> Result<H256, ChainError> {
        let block = self.block_for(tag).await?;
        Ok(self
            .db
            .accounts
            .storage_at(address, slot, &block.header)
            .await?)
    }

    /// Logs matching `filter`. Missing bounds default to the latest block.
    pub async fn logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, ChainError> {
        let latest = self.latest()?.number();
        let from = filter.from_block.unwrap_or(latest);
        let to = filter.to_block.unwrap_or(latest).min(latest);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.db.block_logs.logs(filter, from, to).await?)
    }

    /// Replays the transactions of `block` before `index` on its parent
    /// state and returns the state and the block's execution context.
    async fn replay(&self, block: &Block, index: usize) -> Result<(StateDb, BlockContext), ChainError> {
        let parent = self
            .db
            .blocks
            .get_by_hash(block.header.parent_hash)
            .await?
            .ok_or(ChainError::UnknownBlock)?;
        let mut state = self.db.accounts.state_at(&parent.header)?;
        let ctx = BlockContext::from_header(&block.header, self.config.chain_id);
        for tx in block.transactions.iter().take(index) {
            self.executor.execute(tx, &ctx, &mut state, None).await?;
        }
        Ok((state, ctx))
    }

    /// Storage of `address` as seen by transaction `tx_index` of the block,
    /// from hashed slot `start_key` on, at most `max` entries.
    pub async fn storage_range_at(
        &self,
        block_hash: H256,
        tx_index: usize,
        address: Address,
        start_key: H256,
        max: usize,
    ) -> Result<StorageRange, ChainError> {
        let block = self
            .db
            .blocks
            .get_by_hash(block_hash)
            .await?
            .ok_or(ChainError::UnknownBlock)?;
        let (state, _) = self.replay(&block, tx_index).await?;
        let mut entries = state
            .storage_entries(address)
            .await?
            .into_iter()
            .filter(|(hashed, _)| *hashed >= start_key)
            .collect::<Vec<_>>();
        entries.sort_by_key(|(hashed, _)| *hashed);

        let next_key = entries.get(max).map(|(hashed, _)| *hashed);
        let storage = entries
            .into_iter()
            .take(max)
            .map(|(hashed, value)| {
                let key = state
                    .db()
                    .preimage(hashed)
                    .filter(|raw| raw.len() == 32)
                    .map(|raw| H256::from_slice(&raw));
                (hashed, StorageEntry { key, value })
            })
            .collect();
        Ok(StorageRange { storage, next_key })
    }

    /// Every step of a mined transaction, replayed on the state it ran on.
    pub async fn trace_transaction(&self, hash: H256) -> Result<Vec<StructLog>, ChainError> {
        let record = self
            .db
            .transactions
            .get(hash)
            .await?
            .ok_or(ChainError::UnknownTransaction(hash))?;
        let block = self
            .db
            .blocks
            .get_by_hash(record.block_hash)
            .await?
            .ok_or(ChainError::UnknownBlock)?;
        let index = usize::try_from(record.index).map_err(|_| ChainError::UnknownTransaction(hash))?;
        let (mut state, ctx) = self.replay(&block, index).await?;
        let mut logger = StructLogger::default();
        self.executor
            .execute(
                &record.transaction,
                &ctx,
                &mut state,
                Some(&mut logger as &mut dyn StepTracer),
            )
            .await?;
        Ok(logger.struct_logs())
    }

    /// Stops mining. Admissions continue.
    pub async fn pause(&self) -> Result<(), ChainError> {
        self.ensure_started()?;
        self.miner.pause().await;
        self.status.send_replace(Status::Paused);
        info!("mining paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ChainError> {
        self.ensure_started()?;
        self.miner.resume();
        self.status.send_replace(Status::Started);
        if self.pool.has_executables() {
            self.pool.drain();
        }
        info!("mining resumed");
        Ok(())
    }

    /// Stops mining and admissions and closes the store. Waits for a start
    /// in progress first.
    pub async fn stop(&self) -> Result<(), ChainError> {
        let mut status = self.status.subscribe();
        let current = match status.wait_for(|status| *status != Status::Starting).await {
            Ok(current) => *current,
            Err(_) => Status::Stopped,
        };
        if matches!(current, Status::Stopping | Status::Stopped) {
            return Ok(());
        }
        self.status.send_replace(Status::Stopping);
        self.pool.stop();
        self.miner.pause().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.db.close()?;
        self.status.send_replace(Status::Stopped);
        self.events.lifecycle(Lifecycle::Stop);
        info!("blockchain stopped");
        Ok(())
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Arc<BlockEvent>> {
        self.events.subscribe_blocks()
    }

    pub fn subscribe_block_logs(&self) -> broadcast::Receiver<Arc<BlockLogs>> {
        self.events.subscribe_block_logs()
    }

    pub fn subscribe_pending_transactions(&self) -> broadcast::Receiver<Arc<Transaction>> {
        self.events.subscribe_pending_transactions()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.events.subscribe_lifecycle()
    }
}

async fn apply_overrides(state: &mut StateDb, overrides: &StateOverrides) -> Result<(), StateError> {
    for (&address, account) in overrides {
        if let Some(balance) = account.balance {
            state.set_balance(address, balance).await?;
        }
        if let Some(nonce) = account.nonce {
            state.set_nonce(address, nonce).await?;
        }
        if let Some(code) = &account.code {
            state.set_code(address, code.clone()).await?;
        }
        if let Some(slots) = &account.state {
            state.clear_storage(address).await?;
            for (&slot, &value) in slots {
                state.set_storage(address, slot, value).await?;
            }
        }
        if let Some(slots) = &account.state_diff {
            for (&slot, &value) in slots {
                state.set_storage(address, slot, value).await?;
            }
        }
    }
    Ok(())
}
