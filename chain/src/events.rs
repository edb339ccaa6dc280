//! Typed notification channels.

use std::collections::BTreeMap;
use std::sync::Arc;

use ethereum_types::H256;
use simchain_state::block::Block;
use simchain_state::receipt::BlockLogs;
use simchain_state::transaction::Transaction;
use tokio::sync::broadcast;

const CAPACITY: usize = 256;

/// Raw storage keys touched by `SLOAD`/`SSTORE`, by their hash.
pub type StorageKeys = BTreeMap<H256, H256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub block: Block,
    pub storage_keys: StorageKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Stop,
}

/// Every event is sent once the change it reports is persisted. Logs of a
/// block are sent before the block itself.
#[derive(Debug, Clone)]
pub struct Events {
    block: broadcast::Sender<Arc<BlockEvent>>,
    block_logs: broadcast::Sender<Arc<BlockLogs>>,
    pending_transaction: broadcast::Sender<Arc<Transaction>>,
    lifecycle: broadcast::Sender<Lifecycle>,
}

impl Default for Events {
    fn default() -> Self {
        Self {
            block: broadcast::channel(CAPACITY).0,
            block_logs: broadcast::channel(CAPACITY).0,
            pending_transaction: broadcast::channel(CAPACITY).0,
            lifecycle: broadcast::channel(CAPACITY).0,
        }
    }
}

// Sending fails only when nobody listens.
impl Events {
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Arc<BlockEvent>> {
        self.block.subscribe()
    }

    pub fn subscribe_block_logs(&self) -> broadcast::Receiver<Arc<BlockLogs>> {
        self.block_logs.subscribe()
    }

    pub fn subscribe_pending_transactions(&self) -> broadcast::Receiver<Arc<Transaction>> {
        self.pending_transaction.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn block(&self, event: BlockEvent) {
        let _ = self.block.send(Arc::new(event));
    }

    pub fn block_logs(&self, logs: BlockLogs) {
        let _ = self.block_logs.send(Arc::new(logs));
    }

    pub fn pending_transaction(&self, tx: Transaction) {
        let _ = self.pending_transaction.send(Arc::new(tx));
    }

    pub fn lifecycle(&self, event: Lifecycle) {
        let _ = self.lifecycle.send(event);
    }
}
