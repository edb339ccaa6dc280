//! Content-addressed trie storage shared by every state view.
//!
//! Tries are persistent: an insert rebuilds only the path to the changed leaf
//! and shares every other node with the previous version, so keeping one
//! [`HashedPartialTrie`] per committed root is cheap.

use std::collections::HashMap;
use std::sync::Arc;

use ethereum_types::H256;
use keccak_hash::keccak;
use mpt_trie::nibbles::Nibbles;
use mpt_trie::partial_trie::{HashedPartialTrie, Node, PartialTrie as _};
use parking_lot::RwLock;
use simchain_common::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

use crate::StateError;

/// Every trie version, contract code and key preimage the chain has seen.
#[derive(Debug, Clone, Default)]
pub struct TrieDb {
    inner: Arc<RwLock<TrieDbInner>>,
}

#[derive(Debug, Default)]
struct TrieDbInner {
    tries: HashMap<H256, HashedPartialTrie>,
    code: HashMap<H256, Vec<u8>>,
    preimages: HashMap<H256, Vec<u8>>,
}

impl TrieDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// The trie committed under `root`. The empty root always resolves.
    pub fn trie(&self, root: H256) -> Result<HashedPartialTrie, StateError> {
        if root == EMPTY_TRIE_HASH {
            return Ok(HashedPartialTrie::new(Node::Empty));
        }
        self.inner
            .read()
            .tries
            .get(&root)
            .map(detach)
            .ok_or(StateError::UnknownRoot(root))
    }

    pub fn contains(&self, root: H256) -> bool {
        root == EMPTY_TRIE_HASH || self.inner.read().tries.contains_key(&root)
    }

    /// Records `trie` under its root hash and returns that hash.
    pub fn insert_trie(&self, trie: &HashedPartialTrie) -> H256 {
        let root = trie.hash();
        if root != EMPTY_TRIE_HASH {
            self.inner
                .write()
                .tries
                .entry(root)
                .or_insert_with(|| detach(trie));
        }
        root
    }

    pub fn code(&self, hash: H256) -> Option<Vec<u8>> {
        if hash == EMPTY_CODE_HASH {
            return Some(Vec::new());
        }
        self.inner.read().code.get(&hash).cloned()
    }

    pub fn insert_code(&self, code: Vec<u8>) -> H256 {
        let hash = keccak(&code);
        if hash != EMPTY_CODE_HASH {
            self.inner.write().code.entry(hash).or_insert(code);
        }
        hash
    }

    /// The raw key whose `keccak` is `hashed`, if it was ever written locally.
    pub fn preimage(&self, hashed: H256) -> Option<Vec<u8>> {
        self.inner.read().preimages.get(&hashed).cloned()
    }

    pub fn insert_preimage(&self, raw: &[u8]) -> H256 {
        let hashed = keccak(raw);
        self.inner
            .write()
            .preimages
            .entry(hashed)
            .or_insert_with(|| raw.to_vec());
        hashed
    }
}

/// A copy of `trie` that does not share its root hash cache with the
/// original.
///
/// [`HashedPartialTrie`] clones share the cached root hash, so mutating a
/// plain clone would poison the hash of the trie it was cloned from.
pub fn detach(trie: &HashedPartialTrie) -> HashedPartialTrie {
    HashedPartialTrie::new((**trie).clone())
}

/// Trie path of a raw key: its `keccak` hash.
pub fn hashed_path(raw: &[u8]) -> Nibbles {
    Nibbles::from_h256_be(keccak(raw))
}

fn index_path(index: usize) -> Result<Nibbles, StateError> {
    Ok(Nibbles::from_bytes_be(&rlp::encode(&(index as u64)))?)
}

/// Per-block, `rlp(index) -> encoded transaction`.
///
/// See <https://ethereum.org/en/developers/docs/data-structures-and-encoding/patricia-merkle-trie/#transaction-trie>
#[derive(Debug, Clone, Default)]
pub struct TransactionTrie {
    untyped: HashedPartialTrie,
}

impl TransactionTrie {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, txn_ix: usize, val: Vec<u8>) -> Result<(), StateError> {
        self.untyped.insert(index_path(txn_ix)?, val)?;
        Ok(())
    }
    pub fn root(&self) -> H256 {
        self.untyped.hash()
    }
}

/// Per-block, `rlp(index) -> encoded receipt`.
#[derive(Debug, Clone, Default)]
pub struct ReceiptTrie {
    untyped: HashedPartialTrie,
}

impl ReceiptTrie {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, txn_ix: usize, val: Vec<u8>) -> Result<(), StateError> {
        self.untyped.insert(index_path(txn_ix)?, val)?;
        Ok(())
    }
    pub fn root(&self) -> H256 {
        self.untyped.hash()
    }
}
