//! Admission and nonce ordering of transactions waiting to be mined.
//!
//! Each origin has an executable heap holding a contiguous nonce run that
//! starts at its persisted nonce, and a future heap for transactions behind
//! a gap. Admissions for one origin are serialized so that nonces are
//! assigned in submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256, U512};
use parking_lot::Mutex;
use simchain_common::intrinsic_gas;
use simchain_state::transaction::{Fee, Signature, Transaction, TransactionRequest, UnsignedTransaction};
use simchain_state::StateError;
use thiserror::Error;
use tokio::sync::{watch, Notify, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::config::ChainConfig;
use crate::error::AdmissionError;
use crate::heap::Heap;

/// Identity of a pooled transaction, assigned in admission order.
pub type PoolId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("replaced by a higher priced transaction")]
    Replaced,
    #[error("dropped from the pool")]
    Dropped,
    #[error("{0}")]
    Execution(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finality {
    Pending,
    /// Mined. `error` describes a failed execution.
    Confirmed {
        block_number: u64,
        block_hash: H256,
        error: Option<String>,
    },
    Rejected(RejectReason),
}

pub trait Signer: Send + Sync {
    fn sign(&self, tx: &UnsignedTransaction) -> anyhow::Result<Signature>;
}

/// Nonces of accounts as of the latest block.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn nonce(&self, address: Address) -> Result<u64, StateError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub chain_id: u64,
    pub block_gas_limit: u64,
    pub default_transaction_gas_limit: u64,
    pub default_gas_price: U256,
    pub min_gas_price: U256,
    pub price_bump: u64,
}

impl From<&ChainConfig> for PoolConfig {
    fn from(config: &ChainConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            block_gas_limit: config.block_gas_limit,
            default_transaction_gas_limit: config.default_transaction_gas_limit,
            default_gas_price: config.default_gas_price,
            min_gas_price: config.min_gas_price,
            price_bump: config.price_bump,
        }
    }
}

/// A signed transaction held by the pool until it is finalized.
#[derive(Debug)]
pub struct PooledTransaction {
    pub id: PoolId,
    pub transaction: Transaction,
    locked: AtomicBool,
    finality: watch::Sender<Finality>,
}

impl PooledTransaction {
    pub(crate) fn new(id: PoolId, transaction: Transaction) -> Self {
        Self {
            id,
            transaction,
            locked: AtomicBool::new(false),
            finality: watch::channel(Finality::Pending).0,
        }
    }

    pub fn hash(&self) -> H256 {
        self.transaction.hash
    }

    pub fn from(&self) -> Address {
        self.transaction.from
    }

    pub fn nonce(&self) -> u64 {
        self.transaction.nonce
    }

    /// Claims the transaction for a block under assembly. Returns false when
    /// it is already claimed.
    pub fn lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn finality(&self) -> Finality {
        self.finality.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Finality> {
        self.finality.subscribe()
    }

    /// Waits until the transaction is mined or rejected.
    pub async fn finalized(&self) -> Finality {
        let mut rx = self.finality.subscribe();
        let settled = rx
            .wait_for(|finality| *finality != Finality::Pending)
            .await
            .map(|finality| finality.clone());
        settled.unwrap_or_else(|_| self.finality())
    }

    fn finalize(&self, finality: Finality) {
        self.finality.send_replace(finality);
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub transaction: Arc<PooledTransaction>,
    /// Whether the transaction can be mined now, as opposed to waiting for
    /// a nonce gap to close.
    pub executable: bool,
}

type NonceHeap = Heap<Arc<PooledTransaction>>;

fn lowest_nonce_first(a: &Arc<PooledTransaction>, b: &Arc<PooledTransaction>) -> bool {
    a.nonce() < b.nonce()
}

#[derive(Default)]
struct Queues {
    executables: HashMap<Address, NonceHeap>,
    future: HashMap<Address, NonceHeap>,
    /// Taken from the executables by the miner, awaiting persistence.
    in_progress: HashMap<PoolId, Arc<PooledTransaction>>,
}

impl Queues {
    fn highest_nonce(&self, origin: Address) -> Option<u64> {
        let queued = self
            .executables
            .get(&origin)
            .and_then(|heap| heap.iter().map(|tx| tx.nonce()).max());
        let in_progress = self
            .in_progress
            .values()
            .filter(|tx| tx.from() == origin)
            .map(|tx| tx.nonce())
            .max();
        queued.max(in_progress)
    }

    fn in_progress_at(&self, origin: Address, nonce: u64) -> bool {
        self.in_progress
            .values()
            .any(|tx| tx.from() == origin && tx.nonce() == nonce)
    }

    fn position(heaps: &HashMap<Address, NonceHeap>, origin: Address, nonce: u64) -> Option<usize> {
        heaps.get(&origin)?.position(|tx| tx.nonce() == nonce)
    }

    fn push(heaps: &mut HashMap<Address, NonceHeap>, tx: Arc<PooledTransaction>) {
        heaps
            .entry(tx.from())
            .or_insert_with(|| Heap::new(lowest_nonce_first))
            .push(tx);
    }

    fn remove(
        heaps: &mut HashMap<Address, NonceHeap>,
        origin: Address,
        index: usize,
    ) -> Option<Arc<PooledTransaction>> {
        let heap = heaps.get_mut(&origin)?;
        let removed = heap.remove_at(index);
        if heap.is_empty() {
            heaps.remove(&origin);
        }
        Some(removed)
    }

    /// Moves future transactions that continue the executable run.
    fn promote(&mut self, origin: Address, mut last: u64) {
        while let Some(next) = self
            .future
            .get(&origin)
            .and_then(|heap| heap.peek())
            .filter(|tx| tx.nonce() == last + 1)
            .cloned()
        {
            if let Some(index) = Self::position(&self.future, origin, next.nonce()) {
                Self::remove(&mut self.future, origin, index);
            }
            debug!(hash = ?next.hash(), nonce = next.nonce(), "promoted future transaction");
            last = next.nonce();
            Self::push(&mut self.executables, next);
        }
    }
}

pub struct TxPool {
    config: PoolConfig,
    nonces: Arc<dyn NonceSource>,
    queues: Mutex<Queues>,
    tickets: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    gate: Arc<RwLock<()>>,
    paused: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    /// Serializes pauses, so only one of them waits for the gate.
    pausing: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    next_id: AtomicU64,
    work: Notify,
}

impl TxPool {
    pub fn new(config: PoolConfig, nonces: Arc<dyn NonceSource>) -> Self {
        Self {
            config,
            nonces,
            queues: Mutex::new(Queues::default()),
            tickets: Mutex::new(HashMap::new()),
            gate: Arc::new(RwLock::new(())),
            paused: Mutex::new(None),
            pausing: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            work: Notify::new(),
        }
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Validates, orders and signs `request`, then queues it as executable or
    /// future.
    ///
    /// Without a `signer`, a request carrying no signature gets a
    /// deterministic stand-in one.
    pub async fn prepare(
        &self,
        request: TransactionRequest,
        signer: Option<&dyn Signer>,
    ) -> Result<Admitted, AdmissionError> {
        let _open = self.gate.read().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(AdmissionError::Stopped);
        }

        let gas_limit = request
            .gas_limit
            .unwrap_or(self.config.default_transaction_gas_limit);
        if gas_limit > self.config.block_gas_limit {
            return Err(AdmissionError::GasLimitExceeded);
        }
        let intrinsic = intrinsic_gas(&request.data, request.to.is_none());
        if intrinsic > gas_limit {
            return Err(AdmissionError::IntrinsicGasTooLow {
                limit: gas_limit,
                intrinsic,
            });
        }
        if let Some(chain_id) = request.chain_id {
            if chain_id != self.config.chain_id {
                return Err(AdmissionError::InvalidChainId {
                    got: chain_id,
                    expected: self.config.chain_id,
                });
            }
        }
        let fee = request.fee.unwrap_or(Fee::Legacy {
            gas_price: self.config.default_gas_price,
        });
        if fee.max_fee() < self.config.min_gas_price {
            return Err(AdmissionError::Underpriced);
        }

        let origin = request.from;
        let ticket = self.ticket(origin);
        let admitted = {
            let _turn = ticket.lock().await;
            match self.nonces.nonce(origin).await {
                Ok(persisted) => self.place(request, fee, gas_limit, persisted, signer),
                Err(e) => Err(e.into()),
            }
        };
        self.release_ticket(origin, ticket);

        let admitted = admitted?;
        debug!(
            hash = ?admitted.transaction.hash(),
            from = ?origin,
            nonce = admitted.transaction.nonce(),
            executable = admitted.executable,
            "admitted transaction"
        );
        Ok(admitted)
    }

    /// Decides the nonce, signs and queues. Runs in the origin's turn.
    fn place(
        &self,
        request: TransactionRequest,
        fee: Fee,
        gas_limit: u64,
        persisted: u64,
        signer: Option<&dyn Signer>,
    ) -> Result<Admitted, AdmissionError> {
        let origin = request.from;
        let mut queues = self.queues.lock();

        let (nonce, executable) = match (queues.highest_nonce(origin), request.nonce) {
            (None, None) => (persisted, true),
            (Some(highest), None) => (highest + 1, true),
            (_, Some(nonce)) if nonce < persisted => {
                return Err(AdmissionError::NonceTooLow {
                    got: nonce,
                    expected: persisted,
                })
            }
            (None, Some(nonce)) => (nonce, nonce == persisted),
            (Some(highest), Some(nonce)) => (nonce, nonce <= highest + 1),
        };

        if queues.in_progress_at(origin, nonce) {
            return Err(AdmissionError::Underpriced);
        }
        let replacing_executable = Queues::position(&queues.executables, origin, nonce);
        let replacing_future = Queues::position(&queues.future, origin, nonce);
        for (heaps, index) in [
            (&queues.executables, replacing_executable),
            (&queues.future, replacing_future),
        ] {
            if let Some(existing) = index.and_then(|i| heaps.get(&origin)?.iter().nth(i)) {
                self.check_replacement(existing, &fee)?;
            }
        }

        let unsigned = UnsignedTransaction {
            from: origin,
            nonce,
            fee,
            gas_limit,
            to: request.to,
            value: request.value,
            data: request.data,
            chain_id: self.config.chain_id,
        };
        let signature = match (signer, request.signature) {
            (Some(signer), _) => signer.sign(&unsigned).map_err(AdmissionError::Signer)?,
            (None, Some(signature)) => signature,
            (None, None) => unsigned.fake_signature(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = Arc::new(PooledTransaction::new(id, unsigned.into_signed(signature)));

        let mut replaced = Vec::new();
        if let Some(index) = replacing_future {
            replaced.extend(Queues::remove(&mut queues.future, origin, index));
        }
        match (executable, replacing_executable) {
            (true, Some(index)) => {
                if let Some(heap) = queues.executables.get_mut(&origin) {
                    replaced.push(heap.replace_at(index, tx.clone()));
                }
            }
            (true, None) => {
                Queues::push(&mut queues.executables, tx.clone());
                queues.promote(origin, nonce);
            }
            (false, _) => Queues::push(&mut queues.future, tx.clone()),
        }
        for old in replaced {
            debug!(old = ?old.hash(), new = ?tx.hash(), nonce, "replaced transaction");
            old.finalize(Finality::Rejected(RejectReason::Replaced));
        }

        Ok(Admitted {
            transaction: tx,
            executable,
        })
    }

    /// A replacement must outbid both the fee cap and the tip of the
    /// transaction it replaces by the configured bump.
    fn check_replacement(
        &self,
        existing: &PooledTransaction,
        fee: &Fee,
    ) -> Result<(), AdmissionError> {
        if existing.is_locked() {
            return Err(AdmissionError::Underpriced);
        }
        let bump = U256::from(self.config.price_bump);
        let premium = |price: U256| {
            let raise = U256::try_from(price.full_mul(bump) / U512::from(100)).unwrap_or(U256::MAX);
            price.saturating_add(raise)
        };
        let old = existing.transaction.fee;
        if fee.max_fee() > premium(old.max_fee()) && fee.tip() > premium(old.tip()) {
            Ok(())
        } else {
            Err(AdmissionError::Underpriced)
        }
    }

    fn ticket(&self, origin: Address) -> Arc<tokio::sync::Mutex<()>> {
        self.tickets.lock().entry(origin).or_default().clone()
    }

    fn release_ticket(&self, origin: Address, ticket: Arc<tokio::sync::Mutex<()>>) {
        let mut tickets = self.tickets.lock();
        // Ours and the map's: nobody else is queued behind it.
        if Arc::strong_count(&ticket) == 2 {
            tickets.remove(&origin);
        }
    }

    /// Signals that executable work exists.
    pub fn drain(&self) {
        self.work.notify_one();
    }

    /// Resolves once [`TxPool::drain`] has been called.
    pub async fn work_available(&self) {
        self.work.notified().await;
    }

    /// Holds new admissions and waits for in-flight ones.
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

    /// Refuses every later admission and drops everything queued.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.clear();
    }

    /// Drops every queued transaction. Transactions being mined are kept.
    pub fn clear(&self) {
        let dropped: Vec<_> = {
            let mut queues = self.queues.lock();
            let Queues {
                executables,
                future,
                ..
            } = &mut *queues;
            executables
                .drain()
                .chain(future.drain())
                .flat_map(|(_, mut heap)| heap.drain().collect::<Vec<_>>())
                .collect()
        };
        for tx in dropped {
            tx.finalize(Finality::Rejected(RejectReason::Dropped));
        }
    }

    /// A transaction not yet mined.
    pub fn find(&self, hash: H256) -> Option<Arc<PooledTransaction>> {
        let queues = self.queues.lock();
        let found = queues
            .executables
            .values()
            .chain(queues.future.values())
            .flat_map(|heap| heap.iter())
            .chain(queues.in_progress.values())
            .find(|tx| tx.hash() == hash)
            .cloned();
        found
    }

    pub fn executable_count(&self) -> usize {
        self.queues
            .lock()
            .executables
            .values()
            .map(|heap| heap.len())
            .sum()
    }

    pub fn future_count(&self) -> usize {
        self.queues.lock().future.values().map(|heap| heap.len()).sum()
    }

    pub fn has_executables(&self) -> bool {
        !self.queues.lock().executables.is_empty()
    }

    /// The lowest nonce executable of every origin, in admission order.
    pub fn origins_with_work(&self) -> Vec<Arc<PooledTransaction>> {
        let mut best: Vec<_> = self
            .queues
            .lock()
            .executables
            .values()
            .filter_map(|heap| heap.peek().cloned())
            .collect();
        best.sort_by_key(|tx| tx.id);
        best
    }

    pub fn best_for(&self, origin: Address) -> Option<Arc<PooledTransaction>> {
        self.queues
            .lock()
            .executables
            .get(&origin)
            .and_then(|heap| heap.peek().cloned())
    }

    /// Moves an included transaction from its origin's executables to the
    /// in-progress set.
    pub fn take(&self, tx: &Arc<PooledTransaction>) {
        let mut queues = self.queues.lock();
        if let Some(index) = Queues::position(&queues.executables, tx.from(), tx.nonce()) {
            Queues::remove(&mut queues.executables, tx.from(), index);
        }
        queues.in_progress.insert(tx.id, tx.clone());
    }

    /// Removes `tx` from every queue and finalizes it as rejected.
    pub fn reject(&self, tx: &Arc<PooledTransaction>, reason: RejectReason) {
        {
            let mut queues = self.queues.lock();
            if let Some(index) = Queues::position(&queues.executables, tx.from(), tx.nonce()) {
                Queues::remove(&mut queues.executables, tx.from(), index);
            }
            queues.in_progress.remove(&tx.id);
        }
        warn!(hash = ?tx.hash(), %reason, "rejected transaction");
        tx.unlock();
        tx.finalize(Finality::Rejected(reason));
    }

    /// Finalizes an in-progress transaction once its block is persisted.
    pub fn confirm(
        &self,
        tx: &Arc<PooledTransaction>,
        block_number: u64,
        block_hash: H256,
        error: Option<String>,
    ) {
        self.queues.lock().in_progress.remove(&tx.id);
        tx.unlock();
        tx.finalize(Finality::Confirmed {
            block_number,
            block_hash,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    const ALICE: Address = Address::repeat_byte(0xa1);

    fn pool_with_nonce(nonce: u64) -> TxPool {
        let mut nonces = MockNonceSource::new();
        nonces.expect_nonce().returning(move |_| Ok(nonce));
        TxPool::new(
            PoolConfig::from(&ChainConfig::default()),
            Arc::new(nonces),
        )
    }

    fn request(nonce: Option<u64>, gas_price: u64) -> TransactionRequest {
        TransactionRequest {
            from: ALICE,
            to: Some(Address::repeat_byte(0xb0)),
            nonce,
            fee: Some(Fee::Legacy {
                gas_price: gas_price.into(),
            }),
            gas_limit: Some(21_000),
            ..Default::default()
        }
    }

    fn executable_nonces(pool: &TxPool) -> Vec<u64> {
        let queues = pool.queues.lock();
        let mut nonces: Vec<_> = queues
            .executables
            .get(&ALICE)
            .map(|heap| heap.iter().map(|tx| tx.nonce()).collect())
            .unwrap_or_default();
        nonces.sort();
        nonces
    }

    #[tokio::test]
    async fn nonces_follow_the_persisted_one() {
        let pool = pool_with_nonce(3);
        let first = pool.prepare(request(None, 10), None).await.unwrap();
        let second = pool.prepare(request(None, 10), None).await.unwrap();
        assert!(first.executable && second.executable);
        assert_eq!(first.transaction.nonce(), 3);
        assert_eq!(second.transaction.nonce(), 4);
        assert_ne!(first.transaction.hash(), second.transaction.hash());
    }

    #[tokio::test]
    async fn gaps_wait_in_the_future_queue() {
        let pool = pool_with_nonce(0);
        let gapped = pool.prepare(request(Some(2), 10), None).await.unwrap();
        assert!(!gapped.executable);
        assert_eq!(pool.future_count(), 1);
        assert!(executable_nonces(&pool).is_empty());

        assert!(pool.prepare(request(Some(0), 10), None).await.unwrap().executable);
        assert!(pool.prepare(request(Some(1), 10), None).await.unwrap().executable);
        assert_eq!(executable_nonces(&pool), vec![0, 1, 2]);
        assert_eq!(pool.future_count(), 0);
    }

    #[tokio::test]
    async fn stale_nonces_are_refused() {
        let pool = pool_with_nonce(5);
        assert!(matches!(
            pool.prepare(request(Some(4), 10), None).await,
            Err(AdmissionError::NonceTooLow {
                got: 4,
                expected: 5
            })
        ));
    }

    #[tokio::test]
    async fn replacement_needs_the_bump() {
        let pool = pool_with_nonce(0);
        let original = pool.prepare(request(Some(0), 100), None).await.unwrap();

        // Exactly 10% more is not enough.
        assert!(matches!(
            pool.prepare(request(Some(0), 110), None).await,
            Err(AdmissionError::Underpriced)
        ));
        let replacement = pool.prepare(request(Some(0), 111), None).await.unwrap();
        assert!(replacement.executable);
        assert_eq!(
            original.transaction.finality(),
            Finality::Rejected(RejectReason::Replaced)
        );
        assert_eq!(pool.executable_count(), 1);
        assert!(pool.find(replacement.transaction.hash()).is_some());
        assert!(pool.find(original.transaction.hash()).is_none());
    }

    #[tokio::test]
    async fn eip1559_replacement_bumps_both_fees() {
        let pool = pool_with_nonce(0);
        let fee = |max: u64, tip: u64| TransactionRequest {
            fee: Some(Fee::Eip1559 {
                max_fee_per_gas: max.into(),
                max_priority_fee_per_gas: tip.into(),
            }),
            ..request(Some(0), 0)
        };
        pool.prepare(fee(1_000, 100), None).await.unwrap();
        assert!(matches!(
            pool.prepare(fee(2_000, 100), None).await,
            Err(AdmissionError::Underpriced)
        ));
        pool.prepare(fee(2_000, 200), None).await.unwrap();
    }

    #[tokio::test]
    async fn locked_transactions_cannot_be_replaced() {
        let pool = pool_with_nonce(0);
        let original = pool.prepare(request(Some(0), 100), None).await.unwrap();
        assert!(original.transaction.lock());
        assert!(matches!(
            pool.prepare(request(Some(0), 1_000), None).await,
            Err(AdmissionError::Underpriced)
        ));
    }

    #[tokio::test]
    async fn future_conflicts_follow_the_replacement_rule() {
        let pool = pool_with_nonce(0);
        let original = pool.prepare(request(Some(3), 100), None).await.unwrap();
        assert!(matches!(
            pool.prepare(request(Some(3), 105), None).await,
            Err(AdmissionError::Underpriced)
        ));
        let replacement = pool.prepare(request(Some(3), 200), None).await.unwrap();
        assert!(!replacement.executable);
        assert_eq!(pool.future_count(), 1);
        assert_eq!(
            original.transaction.finality(),
            Finality::Rejected(RejectReason::Replaced)
        );
    }

    #[tokio::test]
    async fn invalid_requests_never_enter_a_queue() {
        let pool = pool_with_nonce(0);
        let too_big = TransactionRequest {
            gas_limit: Some(30_000_001),
            ..request(None, 10)
        };
        assert!(matches!(
            pool.prepare(too_big, None).await,
            Err(AdmissionError::GasLimitExceeded)
        ));

        let too_small = TransactionRequest {
            gas_limit: Some(21_000),
            data: vec![1; 4],
            ..request(None, 10)
        };
        assert!(matches!(
            pool.prepare(too_small, None).await,
            Err(AdmissionError::IntrinsicGasTooLow {
                limit: 21_000,
                intrinsic: 21_064
            })
        ));

        let wrong_chain = TransactionRequest {
            chain_id: Some(1),
            ..request(None, 10)
        };
        assert!(matches!(
            pool.prepare(wrong_chain, None).await,
            Err(AdmissionError::InvalidChainId { got: 1, .. })
        ));
        assert_eq!(pool.executable_count() + pool.future_count(), 0);
    }

    #[tokio::test]
    async fn same_origin_admissions_keep_submission_order() {
        let pool = pool_with_nonce(0);
        let admitted = join_all((0..8).map(|_| pool.prepare(request(None, 10), None))).await;
        let nonces: Vec<_> = admitted
            .into_iter()
            .map(|a| a.unwrap().transaction.nonce())
            .collect();
        assert_eq!(nonces, (0..8).collect::<Vec<_>>());
        assert!(pool.tickets.lock().is_empty());
    }

    #[tokio::test]
    async fn clear_drops_everything_queued() {
        let pool = pool_with_nonce(0);
        let executable = pool.prepare(request(None, 10), None).await.unwrap();
        let future = pool.prepare(request(Some(9), 10), None).await.unwrap();
        pool.clear();
        for tx in [executable.transaction, future.transaction] {
            assert_eq!(tx.finalized().await, Finality::Rejected(RejectReason::Dropped));
        }
        assert!(!pool.has_executables());
    }

    #[tokio::test]
    async fn paused_pool_holds_admissions() {
        let pool = pool_with_nonce(0);
        pool.pause().await;
        let held =
            tokio::time::timeout(Duration::from_millis(50), pool.prepare(request(None, 10), None))
                .await;
        assert!(held.is_err());

        pool.resume();
        assert!(pool.prepare(request(None, 10), None).await.is_ok());
    }

    #[tokio::test]
    async fn racing_pauses_share_one_resume() {
        let pool = pool_with_nonce(0);
        tokio::join!(pool.pause(), pool.pause());
        pool.resume();
        let admitted =
            tokio::time::timeout(Duration::from_millis(50), pool.prepare(request(None, 10), None))
                .await;
        assert!(matches!(admitted, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn replacing_the_highest_price_saturates() {
        let pool = pool_with_nonce(0);
        let ceiling = |tip: u64| TransactionRequest {
            nonce: Some(0),
            fee: Some(Fee::Eip1559 {
                max_fee_per_gas: U256::MAX,
                max_priority_fee_per_gas: tip.into(),
            }),
            ..request(None, 0)
        };
        pool.prepare(ceiling(10), None).await.unwrap();
        assert!(matches!(
            pool.prepare(ceiling(1_000), None).await,
            Err(AdmissionError::Underpriced)
        ));
        assert_eq!(pool.executable_count(), 1);
    }

    #[tokio::test]
    async fn gaps_close_behind_taken_transactions() {
        let pool = pool_with_nonce(0);
        let first = pool.prepare(request(Some(0), 10), None).await.unwrap();
        assert!(first.transaction.lock());
        pool.take(&first.transaction);

        let gapped = pool.prepare(request(Some(2), 10), None).await.unwrap();
        assert!(!gapped.executable);
        assert_eq!(pool.future_count(), 1);

        let filler = pool.prepare(request(Some(1), 10), None).await.unwrap();
        assert!(filler.executable);
        assert_eq!(executable_nonces(&pool), vec![1, 2]);
        assert_eq!(pool.future_count(), 0);
    }

    #[tokio::test]
    async fn taken_transactions_block_their_nonce() {
        let pool = pool_with_nonce(0);
        let first = pool.prepare(request(None, 10), None).await.unwrap();
        assert!(first.transaction.lock());
        pool.take(&first.transaction);
        assert!(!pool.has_executables());
        assert!(pool.find(first.transaction.hash()).is_some());

        // The persisted nonce lags until the block is written.
        let next = pool.prepare(request(None, 10), None).await.unwrap();
        assert_eq!(next.transaction.nonce(), 1);

        pool.confirm(&first.transaction, 1, H256::repeat_byte(1), None);
        assert!(matches!(
            first.transaction.finalized().await,
            Finality::Confirmed { block_number: 1, .. }
        ));
        assert!(pool.find(first.transaction.hash()).is_none());
    }
}
