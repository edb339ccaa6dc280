//! Where a [`TrieStore`](crate::trie_store::TrieStore) looks for keys it does
//! not hold.

use std::sync::Arc;

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use tracing::trace;

use crate::account::Account;
use crate::remote::ForkClient;
use crate::trie::TrieDb;
use crate::StateError;

/// Fallback lookup for keys missing from the local trie.
///
/// `key` is the raw key: an address for the account trie, a slot for a
/// storage trie. `scope` is the account owning the storage trie, if any.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        key: &[u8],
        scope: Option<Address>,
        block_number: Option<u64>,
    ) -> Result<Option<Vec<u8>>, StateError>;

    /// Whether a miss can be answered by something other than "absent".
    fn is_remote(&self) -> bool {
        false
    }
}

/// Nothing exists beyond the local trie.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(
        &self,
        _key: &[u8],
        _scope: Option<Address>,
        _block_number: Option<u64>,
    ) -> Result<Option<Vec<u8>>, StateError> {
        Ok(None)
    }
}

/// Answers misses from the forked chain, reading it at the requested block
/// when that predates the pin and at the pin otherwise.
///
/// Accounts are synthesized with an empty storage root; their slots are
/// fetched one by one as the storage trie misses them. Contract code is
/// written to the local [`TrieDb`] so it resolves by hash like local code.
pub struct ForkFetcher {
    client: Arc<ForkClient>,
    db: TrieDb,
}

impl ForkFetcher {
    pub fn new(client: Arc<ForkClient>, db: TrieDb) -> Self {
        Self { client, db }
    }

    pub fn client(&self) -> &Arc<ForkClient> {
        &self.client
    }

    async fn fetch_account(
        &self,
        address: Address,
        block_number: u64,
    ) -> Result<Option<Vec<u8>>, StateError> {
        let (balance, nonce, code) = futures::try_join!(
            self.client.balance(address, block_number),
            self.client.nonce(address, block_number),
            self.client.code(address, block_number),
        )?;
        if balance.is_zero() && nonce == 0 && code.is_empty() {
            return Ok(None);
        }
        let account = Account {
            nonce,
            balance,
            code_hash: self.db.insert_code(code),
            ..Default::default()
        };
        trace!(?address, block_number, ?account, "imported remote account");
        Ok(Some(rlp::encode(&account).to_vec()))
    }

    async fn fetch_slot(
        &self,
        address: Address,
        slot: H256,
        block_number: u64,
    ) -> Result<Option<Vec<u8>>, StateError> {
        let value = self.client.storage_at(address, slot, block_number).await?;
        if value.is_zero() {
            return Ok(None);
        }
        Ok(Some(
            rlp::encode(&U256::from_big_endian(value.as_bytes())).to_vec(),
        ))
    }
}

#[async_trait]
impl Fetcher for ForkFetcher {
    async fn fetch(
        &self,
        key: &[u8],
        scope: Option<Address>,
        block_number: Option<u64>,
    ) -> Result<Option<Vec<u8>>, StateError> {
        let block_number = self.client.remote_block_number(block_number);
        match scope {
            None if key.len() == Address::len_bytes() => {
                self.fetch_account(Address::from_slice(key), block_number)
                    .await
            }
            Some(address) if key.len() == H256::len_bytes() => {
                self.fetch_slot(address, H256::from_slice(key), block_number)
                    .await
            }
            _ => Ok(None),
        }
    }

    fn is_remote(&self) -> bool {
        true
    }
}
