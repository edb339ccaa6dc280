//! Chain records persisted in a [`KeyValueStore`], with read-through to the
//! forked chain for anything at or before the fork pin.

use std::sync::Arc;

use ethereum_types::{Address, H256, U256};
use simchain_common::EMPTY_TRIE_HASH;
use tracing::debug;

use crate::account::Account;
use crate::block::{block_number_from_key, block_number_key, Block, Header, TransactionRecord};
use crate::fork::{Fetcher, ForkFetcher, LocalFetcher};
use crate::kv::{BatchOp, KeyValueStore, Sublevel};
use crate::receipt::{BlockLogs, LogEntry, LogFilter, ReceiptRecord};
use crate::remote::ForkClient;
use crate::state_db::StateDb;
use crate::trie::TrieDb;
use crate::StateError;

const LATEST_KEY: &[u8] = b"latest";
const EARLIEST_KEY: &[u8] = b"earliest";

/// A block selector as accepted by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Earliest,
    Latest,
    Pending,
    Number(u64),
    Hash(H256),
}

impl From<u64> for BlockTag {
    fn from(number: u64) -> Self {
        BlockTag::Number(number)
    }
}

/// Every record manager over one store.
pub struct ChainDb {
    store: Arc<dyn KeyValueStore>,
    pub blocks: BlockManager,
    pub transactions: TransactionManager,
    pub receipts: ReceiptManager,
    pub block_logs: BlockLogManager,
    pub accounts: AccountManager,
}

impl ChainDb {
    pub fn new(store: Arc<dyn KeyValueStore>, trie_db: TrieDb, fork: Option<Arc<ForkClient>>) -> Self {
        let fetcher: Arc<dyn Fetcher> = match &fork {
            Some(client) => Arc::new(ForkFetcher::new(client.clone(), trie_db.clone())),
            None => Arc::new(LocalFetcher),
        };
        Self {
            blocks: BlockManager {
                blocks: Sublevel::new(store.clone(), "b"),
                hashes: Sublevel::new(store.clone(), "h"),
                meta: Sublevel::new(store.clone(), "m"),
                fork: fork.clone(),
            },
            transactions: TransactionManager {
                level: Sublevel::new(store.clone(), "t"),
                fork: fork.clone(),
            },
            receipts: ReceiptManager {
                level: Sublevel::new(store.clone(), "r"),
                fork: fork.clone(),
            },
            block_logs: BlockLogManager {
                level: Sublevel::new(store.clone(), "l"),
                fork: fork.clone(),
            },
            accounts: AccountManager {
                trie_db,
                fetcher,
                fork,
            },
            store,
        }
    }

    pub fn open(&self) -> Result<(), StateError> {
        Ok(self.store.open()?)
    }

    pub fn close(&self) -> Result<(), StateError> {
        Ok(self.store.close()?)
    }

    pub fn fork(&self) -> Option<&Arc<ForkClient>> {
        self.accounts.fork.as_ref()
    }

    /// Writes a block and everything it produced in one batch, then moves the
    /// latest pointer to it.
    pub fn write_block(
        &self,
        block: &Block,
        receipts: &[ReceiptRecord],
        logs: &BlockLogs,
    ) -> Result<(), StateError> {
        let mut ops = self.blocks.put_ops(block);
        for (index, tx) in block.transactions.iter().enumerate() {
            let record = TransactionRecord {
                transaction: tx.clone(),
                block_hash: block.hash(),
                block_number: block.number(),
                index: index as u64,
            };
            ops.push(self.transactions.level.put_op(tx.hash.as_bytes(), record.to_bytes()));
        }
        for receipt in receipts {
            ops.push(
                self.receipts
                    .level
                    .put_op(receipt.transaction_hash.as_bytes(), receipt.to_bytes()),
            );
        }
        ops.push(
            self.block_logs
                .level
                .put_op(&block_number_key(block.number()), logs.to_bytes()),
        );
        if self.blocks.earliest_number()?.is_none() {
            ops.push(
                self.blocks
                    .meta
                    .put_op(EARLIEST_KEY, block_number_key(block.number())),
            );
        }
        self.store.batch(ops)?;
        self.blocks.set_latest(block.number())?;
        debug!(number = block.number(), hash = ?block.hash(), "block written");
        Ok(())
    }

    /// Deletes every block after `number` along with its transactions,
    /// receipts and logs, and points latest at `number`.
    pub fn delete_after(&self, number: u64) -> Result<Vec<Block>, StateError> {
        let Some(latest) = self.blocks.latest_number()? else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        let mut ops = Vec::new();
        for n in number + 1..=latest {
            let Some(block) = self.blocks.local(n)? else {
                continue;
            };
            ops.extend(self.blocks.delete_ops(&block));
            for tx in &block.transactions {
                ops.push(self.transactions.level.del_op(tx.hash.as_bytes()));
                ops.push(self.receipts.level.del_op(tx.hash.as_bytes()));
            }
            ops.push(self.block_logs.level.del_op(&block_number_key(n)));
            removed.push(block);
        }
        ops.push(self.blocks.meta.put_op(LATEST_KEY, block_number_key(number)));
        self.store.batch(ops)?;
        Ok(removed)
    }
}

pub struct BlockManager {
    blocks: Sublevel,
    hashes: Sublevel,
    meta: Sublevel,
    fork: Option<Arc<ForkClient>>,
}

impl BlockManager {
    pub fn latest_number(&self) -> Result<Option<u64>, StateError> {
        Ok(self
            .meta
            .get(LATEST_KEY)?
            .and_then(|key| block_number_from_key(&key)))
    }

    pub fn earliest_number(&self) -> Result<Option<u64>, StateError> {
        Ok(self
            .meta
            .get(EARLIEST_KEY)?
            .and_then(|key| block_number_from_key(&key)))
    }

    pub fn set_latest(&self, number: u64) -> Result<(), StateError> {
        Ok(self.meta.put(LATEST_KEY, &block_number_key(number))?)
    }

    pub fn latest(&self) -> Result<Option<Block>, StateError> {
        match self.latest_number()? {
            Some(number) => self.local(number),
            None => Ok(None),
        }
    }

    pub fn earliest(&self) -> Result<Option<Block>, StateError> {
        match self.earliest_number()? {
            Some(number) => self.local(number),
            None => Ok(None),
        }
    }

    /// A block held in the local store.
    pub fn local(&self, number: u64) -> Result<Option<Block>, StateError> {
        self.blocks
            .get(&block_number_key(number))?
            .map(|bytes| Block::from_bytes(&bytes))
            .transpose()
            .map_err(StateError::from)
    }

    pub async fn get(&self, number: u64) -> Result<Option<Block>, StateError> {
        if let Some(block) = self.local(number)? {
            return Ok(Some(block));
        }
        match &self.fork {
            Some(fork) if fork.is_before_pin(number) => Ok(fork.block_by_number(number).await?),
            _ => Ok(None),
        }
    }

    pub async fn get_by_hash(&self, hash: H256) -> Result<Option<Block>, StateError> {
        if let Some(key) = self.hashes.get(hash.as_bytes())? {
            if let Some(number) = block_number_from_key(&key) {
                return self.local(number);
            }
        }
        match &self.fork {
            Some(fork) => Ok(fork.block_by_hash(hash).await?),
            None => Ok(None),
        }
    }

    /// Resolves a tag to a block. `Pending` resolves to latest.
    pub async fn by_tag(&self, tag: BlockTag) -> Result<Option<Block>, StateError> {
        match tag {
            BlockTag::Latest | BlockTag::Pending => self.latest(),
            BlockTag::Earliest => self.earliest(),
            BlockTag::Number(number) => self.get(number).await,
            BlockTag::Hash(hash) => self.get_by_hash(hash).await,
        }
    }

    fn put_ops(&self, block: &Block) -> Vec<BatchOp> {
        let key = block_number_key(block.number());
        vec![
            self.blocks.put_op(&key, block.to_bytes()),
            self.hashes.put_op(block.hash().as_bytes(), key),
        ]
    }

    fn delete_ops(&self, block: &Block) -> Vec<BatchOp> {
        vec![
            self.blocks.del_op(&block_number_key(block.number())),
            self.hashes.del_op(block.hash().as_bytes()),
        ]
    }
}

pub struct TransactionManager {
    level: Sublevel,
    fork: Option<Arc<ForkClient>>,
}

impl TransactionManager {
    pub async fn get(&self, hash: H256) -> Result<Option<TransactionRecord>, StateError> {
        if let Some(bytes) = self.level.get(hash.as_bytes())? {
            return Ok(Some(TransactionRecord::from_bytes(&bytes)?));
        }
        let Some(fork) = &self.fork else {
            return Ok(None);
        };
        Ok(fork
            .transaction(hash)
            .await?
            .map(|(transaction, block_hash, block_number, index)| TransactionRecord {
                transaction,
                block_hash,
                block_number,
                index,
            }))
    }
}

pub struct ReceiptManager {
    level: Sublevel,
    fork: Option<Arc<ForkClient>>,
}

impl ReceiptManager {
    pub async fn get(&self, hash: H256) -> Result<Option<ReceiptRecord>, StateError> {
        if let Some(bytes) = self.level.get(hash.as_bytes())? {
            return Ok(Some(ReceiptRecord::from_bytes(&bytes)?));
        }
        match &self.fork {
            Some(fork) => Ok(fork.receipt(hash).await?),
            None => Ok(None),
        }
    }
}

pub struct BlockLogManager {
    level: Sublevel,
    fork: Option<Arc<ForkClient>>,
}

impl BlockLogManager {
    pub fn local(&self, number: u64) -> Result<Option<BlockLogs>, StateError> {
        self.level
            .get(&block_number_key(number))?
            .map(|bytes| BlockLogs::from_bytes(&bytes))
            .transpose()
            .map_err(StateError::from)
    }

    /// Matching logs of blocks `from..=to`, remote ones first.
    pub async fn logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>, StateError> {
        let mut found = Vec::new();
        let mut local_from = from;
        if let Some(fork) = &self.fork {
            if fork.is_before_pin(from) {
                found.extend(fork.logs(filter, from, to).await?);
            }
            local_from = local_from.max(fork.pin().number + 1);
        }
        for number in local_from..=to {
            if let Some(logs) = self.local(number)? {
                found.extend(logs.filter(filter));
            }
        }
        Ok(found)
    }
}

/// Account state as of a given block.
pub struct AccountManager {
    trie_db: TrieDb,
    fetcher: Arc<dyn Fetcher>,
    fork: Option<Arc<ForkClient>>,
}

impl AccountManager {
    pub fn trie_db(&self) -> &TrieDb {
        &self.trie_db
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        self.fetcher.clone()
    }

    /// A fresh [`StateDb`] for the state after `header`. Blocks at or before
    /// the fork pin have no local trie; their state is read entirely from the
    /// remote chain at that block.
    pub fn state_at(&self, header: &Header) -> Result<StateDb, StateError> {
        let root = match &self.fork {
            Some(fork) if fork.is_before_pin(header.number) => EMPTY_TRIE_HASH,
            _ => header.state_root,
        };
        StateDb::at(
            self.trie_db.clone(),
            self.fetcher.clone(),
            root,
            Some(header.number),
        )
    }

    pub async fn get(&self, address: Address, header: &Header) -> Result<Option<Account>, StateError> {
        self.state_at(header)?.account(address).await
    }

    pub async fn balance(&self, address: Address, header: &Header) -> Result<U256, StateError> {
        self.state_at(header)?.balance(address).await
    }

    pub async fn nonce(&self, address: Address, header: &Header) -> Result<u64, StateError> {
        self.state_at(header)?.nonce(address).await
    }

    pub async fn code(&self, address: Address, header: &Header) -> Result<Vec<u8>, StateError> {
        self.state_at(header)?.code(address).await
    }

    pub async fn storage_at(
        &self,
        address: Address,
        slot: H256,
        header: &Header,
    ) -> Result<H256, StateError> {
        self.state_at(header)?.storage(address, slot).await
    }
}
