use std::sync::Arc;

use simchain_state::block::Block;
use simchain_state::managers::ChainDb;
use simchain_state::receipt::{BlockLogs, ReceiptRecord};
use tokio::sync::Mutex;
use tracing::info;

use crate::events::{BlockEvent, Events, StorageKeys};
use crate::ChainError;

/// A block with everything its execution produced.
#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub block: Block,
    pub receipts: Vec<ReceiptRecord>,
    pub logs: BlockLogs,
    pub storage_keys: StorageKeys,
}

/// Persists blocks one at a time and announces them once durable.
pub struct BlockWriter {
    db: Arc<ChainDb>,
    events: Events,
    saving: Mutex<()>,
}

impl BlockWriter {
    pub fn new(db: Arc<ChainDb>, events: Events) -> Self {
        Self {
            db,
            events,
            saving: Mutex::new(()),
        }
    }

    pub async fn save(&self, mined: MinedBlock) -> Result<Block, ChainError> {
        let _saving = self.saving.lock().await;
        let MinedBlock {
            block,
            receipts,
            logs,
            storage_keys,
        } = mined;
        self.db.write_block(&block, &receipts, &logs)?;
        info!(
            number = block.number(),
            hash = ?block.hash(),
            transactions = block.transactions.len(),
            gas_used = block.header.gas_used,
            "block saved"
        );
        self.events.block_logs(logs);
        self.events.block(BlockEvent {
            block: block.clone(),
            storage_keys,
        });
        Ok(block)
    }

    /// Waits for a save in flight, if any.
    pub async fn settled(&self) {
        drop(self.saving.lock().await);
    }
}
