//! Accounts, storage and code as seen by transaction execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use ethereum_types::{Address, BigEndianHash as _, H256, U256};
use simchain_common::EMPTY_TRIE_HASH;

use crate::account::Account;
use crate::fork::Fetcher;
use crate::trie::TrieDb;
use crate::trie_store::TrieStore;
use crate::StateError;

/// World state rooted at one account trie.
///
/// Storage tries touched since the last [`StateDb::flush`] are held open in
/// an overlay; an account read reports the overlay's root as its storage
/// root, so callers always observe settled roots.
pub struct StateDb {
    accounts: TrieStore,
    storage: BTreeMap<Address, TrieStore>,
    checkpoints: Vec<BTreeMap<Address, TrieStore>>,
}

impl StateDb {
    /// An empty state.
    pub fn new(db: TrieDb, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            accounts: TrieStore::new(db, fetcher),
            storage: BTreeMap::new(),
            checkpoints: Vec::new(),
        }
    }

    /// The state committed under `root` as of `block_number`.
    pub fn at(
        db: TrieDb,
        fetcher: Arc<dyn Fetcher>,
        root: H256,
        block_number: Option<u64>,
    ) -> Result<Self, StateError> {
        let mut state = Self::new(db, fetcher);
        state.set_root(root, block_number)?;
        Ok(state)
    }

    /// Replaces the whole state with the one committed under `root`,
    /// discarding the overlay and every checkpoint.
    pub fn set_root(&mut self, root: H256, block_number: Option<u64>) -> Result<(), StateError> {
        self.accounts.set_context(root, None, block_number)?;
        self.storage.clear();
        self.checkpoints.clear();
        Ok(())
    }

    pub fn db(&self) -> &TrieDb {
        self.accounts.db()
    }

    pub fn block_number(&self) -> Option<u64> {
        self.accounts.context().block_number
    }

    /// Root of the account trie. Storage written since the last flush is
    /// only reflected once flushed.
    pub fn root(&self) -> H256 {
        self.accounts.root()
    }

    pub async fn account(&self, address: Address) -> Result<Option<Account>, StateError> {
        let Some(bytes) = self.accounts.get(address.as_bytes()).await? else {
            return Ok(None);
        };
        let mut account: Account = rlp::decode(&bytes)?;
        if let Some(storage) = self.storage.get(&address) {
            account.storage_root = storage.root();
        }
        Ok(Some(account))
    }

    pub async fn account_or_default(&self, address: Address) -> Result<Account, StateError> {
        Ok(self.account(address).await?.unwrap_or_default())
    }

    pub fn put_account(&mut self, address: Address, account: &Account) -> Result<(), StateError> {
        self.accounts
            .put(address.as_bytes(), rlp::encode(account).to_vec())
    }

    pub fn delete_account(&mut self, address: Address) -> Result<(), StateError> {
        self.storage.remove(&address);
        self.accounts.del(address.as_bytes())
    }

    pub async fn balance(&self, address: Address) -> Result<U256, StateError> {
        Ok(self.account_or_default(address).await?.balance)
    }

    pub async fn nonce(&self, address: Address) -> Result<u64, StateError> {
        Ok(self.account_or_default(address).await?.nonce)
    }

    pub async fn set_balance(&mut self, address: Address, balance: U256) -> Result<(), StateError> {
        let mut account = self.account_or_default(address).await?;
        account.balance = balance;
        self.put_account(address, &account)
    }

    pub async fn set_nonce(&mut self, address: Address, nonce: u64) -> Result<(), StateError> {
        let mut account = self.account_or_default(address).await?;
        account.nonce = nonce;
        self.put_account(address, &account)
    }

    pub async fn code(&self, address: Address) -> Result<Vec<u8>, StateError> {
        let account = self.account_or_default(address).await?;
        Ok(self.db().code(account.code_hash).unwrap_or_default())
    }

    pub async fn set_code(&mut self, address: Address, code: Vec<u8>) -> Result<(), StateError> {
        let mut account = self.account_or_default(address).await?;
        account.code_hash = self.db().insert_code(code);
        self.put_account(address, &account)
    }

    pub async fn storage(&self, address: Address, slot: H256) -> Result<H256, StateError> {
        let value = match self.storage.get(&address) {
            Some(open) => open.get(slot.as_bytes()).await?,
            None => {
                let root = self.account_or_default(address).await?.storage_root;
                self.open_storage(address, root)?
                    .get(slot.as_bytes())
                    .await?
            }
        };
        Ok(match value {
            Some(bytes) => {
                let value: U256 = rlp::decode(&bytes)?;
                H256::from_uint(&value)
            }
            None => H256::zero(),
        })
    }

    /// Writes a slot. A zero value deletes it.
    pub async fn set_storage(
        &mut self,
        address: Address,
        slot: H256,
        value: H256,
    ) -> Result<(), StateError> {
        let mut open = match self.storage.remove(&address) {
            Some(open) => open,
            None => {
                let account = self.account_or_default(address).await?;
                // The account must exist for its storage root to be recorded.
                self.put_account(address, &account)?;
                self.open_storage(address, account.storage_root)?
            }
        };
        let written = if value.is_zero() {
            open.del(slot.as_bytes())
        } else {
            let value = U256::from_big_endian(value.as_bytes());
            open.put(slot.as_bytes(), rlp::encode(&value).to_vec())
        };
        self.storage.insert(address, open);
        written
    }

    /// Empties an account's storage without touching the rest of it.
    pub async fn clear_storage(&mut self, address: Address) -> Result<(), StateError> {
        let account = self.account_or_default(address).await?;
        let mut empty = self.open_storage(address, EMPTY_TRIE_HASH)?;
        if self.accounts.fetcher().is_remote() {
            // Tombstone whatever the remote holds for slots we know about.
            let existing = match self.storage.get(&address) {
                Some(open) => open.entries(),
                None => self.open_storage(address, account.storage_root)?.entries(),
            };
            for (hashed, _) in existing {
                if let Some(raw) = self.db().preimage(hashed) {
                    empty.del(&raw)?;
                }
            }
        }
        self.storage.insert(address, empty);
        self.put_account(address, &account)
    }

    /// Locally held slots of `address` as `(keccak(slot), value)`, in trie
    /// order.
    pub async fn storage_entries(&self, address: Address) -> Result<Vec<(H256, H256)>, StateError> {
        let entries = match self.storage.get(&address) {
            Some(open) => open.entries(),
            None => {
                let root = self.account_or_default(address).await?.storage_root;
                self.open_storage(address, root)?.entries()
            }
        };
        entries
            .into_iter()
            .map(|(hashed, bytes)| -> Result<(H256, H256), StateError> {
                let value: U256 = rlp::decode(&bytes)?;
                Ok((hashed, H256::from_uint(&value)))
            })
            .collect()
    }

    pub fn checkpoint(&mut self) {
        self.accounts.checkpoint();
        self.checkpoints.push(self.copy_storage());
    }

    pub fn commit(&mut self) -> Result<(), StateError> {
        self.accounts.commit()?;
        self.checkpoints.pop();
        Ok(())
    }

    pub fn revert(&mut self) -> Result<(), StateError> {
        self.accounts.revert()?;
        self.storage = self
            .checkpoints
            .pop()
            .ok_or(StateError::NoCheckpoint("revert"))?;
        Ok(())
    }

    /// Settles every open storage trie into its account, records all tries
    /// in the [`TrieDb`] and returns the state root.
    pub async fn flush(&mut self) -> Result<H256, StateError> {
        let open = std::mem::take(&mut self.storage);
        for (address, mut storage) in open {
            let storage_root = storage.persist();
            if let Some(mut account) = self.account(address).await? {
                account.storage_root = storage_root;
                self.put_account(address, &account)?;
            }
        }
        Ok(self.accounts.persist())
    }

    /// An independent copy for speculative execution. Checkpoints are not
    /// carried over.
    pub fn copy(&self) -> Self {
        Self {
            accounts: self.accounts.copy(false),
            storage: self.copy_storage(),
            checkpoints: Vec::new(),
        }
    }

    fn copy_storage(&self) -> BTreeMap<Address, TrieStore> {
        self.storage
            .iter()
            .map(|(address, store)| (*address, store.copy(false)))
            .collect()
    }

    fn open_storage(&self, address: Address, root: H256) -> Result<TrieStore, StateError> {
        let mut store = TrieStore::new(self.db().clone(), self.accounts.fetcher());
        store.set_context(root, Some(address), self.block_number())?;
        Ok(store)
    }
}
