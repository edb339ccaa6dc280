//! Ordered byte-key/byte-value storage with atomic batches and sublevels.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("store is corrupt: {0}")]
    Corrupt(String),
}

/// A single write inside an atomic [`KeyValueStore::batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

pub trait KeyValueStore: Send + Sync {
    fn open(&self) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn del(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Applies every operation or none of them.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// In-memory [`KeyValueStore`] backed by a [`BTreeMap`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    open: bool,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().open
    }
}

impl KeyValueStore for MemoryStore {
    fn open(&self) -> Result<(), StoreError> {
        self.inner.write().open = true;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.write().open = false;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read();
        if !inner.open {
            return Err(StoreError::Closed);
        }
        Ok(inner.entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.open {
            return Err(StoreError::Closed);
        }
        inner.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.open {
            return Err(StoreError::Closed);
        }
        inner.entries.remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.open {
            return Err(StoreError::Closed);
        }
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    inner.entries.insert(key, value);
                }
                BatchOp::Del { key } => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let inner = self.inner.read();
        if !inner.open {
            return Err(StoreError::Closed);
        }
        Ok(inner
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// A namespace inside a [`KeyValueStore`], realised as a key prefix.
#[derive(Clone)]
pub struct Sublevel {
    store: Arc<dyn KeyValueStore>,
    prefix: Vec<u8>,
}

impl Sublevel {
    pub fn new(store: Arc<dyn KeyValueStore>, name: &str) -> Self {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(b'!');
        Self { store, prefix }
    }

    /// The full key of `key` inside this namespace.
    pub fn key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        full
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&self.key(key))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.store.put(&self.key(key), value)
    }

    pub fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        self.store.del(&self.key(key))
    }

    pub fn put_op(&self, key: &[u8], value: Vec<u8>) -> BatchOp {
        BatchOp::Put {
            key: self.key(key),
            value,
        }
    }

    pub fn del_op(&self, key: &[u8]) -> BatchOp {
        BatchOp::Del { key: self.key(key) }
    }

    /// Entries of this namespace with the prefix stripped from their keys.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .store
            .scan_prefix(&self.prefix)?
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_vec(), v))
            .collect())
    }
}
