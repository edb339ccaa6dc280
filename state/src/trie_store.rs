//! A keyed view over one trie at a time, with checkpoints and a fallback
//! [`Fetcher`] for keys that are not held locally.

use std::sync::Arc;

use ethereum_types::{Address, H256};
use mpt_trie::partial_trie::{HashedPartialTrie, PartialTrie as _};
use mpt_trie::trie_ops::ValOrHash;
use simchain_common::EMPTY_TRIE_HASH;

use crate::fork::Fetcher;
use crate::trie::{detach, hashed_path, TrieDb};
use crate::StateError;

/// Value written in place of a deleted key when a remote fallback is active,
/// so that the deletion shadows the remote entry. Never a valid account or
/// storage encoding.
pub const TOMBSTONE: &[u8] = &[0x80];

/// Which trie a [`TrieStore`] reads: the root, the account whose storage it
/// is (`None` for the account trie), and the block the state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieContext {
    pub root: H256,
    pub scope: Option<Address>,
    pub block_number: Option<u64>,
}

impl Default for TrieContext {
    fn default() -> Self {
        Self {
            root: EMPTY_TRIE_HASH,
            scope: None,
            block_number: None,
        }
    }
}

pub struct TrieStore {
    db: TrieDb,
    fetcher: Arc<dyn Fetcher>,
    trie: HashedPartialTrie,
    context: TrieContext,
    checkpoints: Vec<HashedPartialTrie>,
}

impl TrieStore {
    pub fn new(db: TrieDb, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            db,
            fetcher,
            trie: HashedPartialTrie::default(),
            context: TrieContext::default(),
            checkpoints: Vec::new(),
        }
    }

    /// Switches to the trie committed under `root`, dropping any uncommitted
    /// writes and checkpoints.
    pub fn set_context(
        &mut self,
        root: H256,
        scope: Option<Address>,
        block_number: Option<u64>,
    ) -> Result<(), StateError> {
        self.trie = self.db.trie(root)?;
        self.context = TrieContext {
            root,
            scope,
            block_number,
        };
        self.checkpoints.clear();
        Ok(())
    }

    pub const fn context(&self) -> TrieContext {
        self.context
    }

    pub const fn db(&self) -> &TrieDb {
        &self.db
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        self.fetcher.clone()
    }

    /// The root of the working trie, uncommitted writes included.
    pub fn root(&self) -> H256 {
        self.trie.hash()
    }

    /// The locally held value of `key`. A tombstone reads as `Some(None)`:
    /// known to be absent.
    pub fn get_local(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let value = self.trie.get(hashed_path(key))?;
        Some((value != TOMBSTONE).then(|| value.to_vec()))
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        match self.get_local(key) {
            Some(value) => Ok(value),
            None => {
                self.fetcher
                    .fetch(key, self.context.scope, self.context.block_number)
                    .await
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        self.db.insert_preimage(key);
        self.trie.insert(hashed_path(key), value)?;
        Ok(())
    }

    pub fn del(&mut self, key: &[u8]) -> Result<(), StateError> {
        if self.fetcher.is_remote() {
            self.trie.insert(hashed_path(key), TOMBSTONE.to_vec())?;
        } else {
            self.trie.delete(hashed_path(key))?;
        }
        Ok(())
    }

    /// A store over the same trie that can be mutated independently.
    pub fn copy(&self, include_checkpoints: bool) -> Self {
        Self {
            db: self.db.clone(),
            fetcher: self.fetcher.clone(),
            trie: detach(&self.trie),
            context: self.context,
            checkpoints: match include_checkpoints {
                true => self.checkpoints.iter().map(detach).collect(),
                false => Vec::new(),
            },
        }
    }

    pub fn checkpoint(&mut self) {
        self.checkpoints.push(detach(&self.trie));
    }

    /// Keeps every write since the last checkpoint.
    pub fn commit(&mut self) -> Result<(), StateError> {
        self.checkpoints
            .pop()
            .map(drop)
            .ok_or(StateError::NoCheckpoint("commit"))
    }

    /// Discards every write since the last checkpoint.
    pub fn revert(&mut self) -> Result<(), StateError> {
        self.trie = self
            .checkpoints
            .pop()
            .ok_or(StateError::NoCheckpoint("revert"))?;
        Ok(())
    }

    pub fn has_checkpoints(&self) -> bool {
        !self.checkpoints.is_empty()
    }

    /// Records the working trie in the shared [`TrieDb`] and makes it the
    /// context root.
    pub fn persist(&mut self) -> H256 {
        let root = self.db.insert_trie(&self.trie);
        self.context.root = root;
        root
    }

    /// Locally held entries as `(keccak(key), value)`, tombstones excluded,
    /// in trie order.
    pub fn entries(&self) -> Vec<(H256, Vec<u8>)> {
        self.trie
            .items()
            .filter_map(|(path, value)| match value {
                ValOrHash::Val(v) if v != TOMBSTONE => Some((H256::from(path), v)),
                _ => None,
            })
            .collect()
    }
}
