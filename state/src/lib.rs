//! World state and chain records for simchain.
//!
//! The [`trie_store::TrieStore`] is the cryptographically keyed store every
//! account and storage read goes through. In fork mode it is paired with a
//! [`fork::ForkFetcher`] which lazily pulls missing entries from a remote
//! chain pinned at a fixed block. [`state_db::StateDb`] layers accounts,
//! storage and code on top, and [`managers::ChainDb`] persists blocks,
//! transactions, receipts and logs in a [`kv::KeyValueStore`].

pub mod account;
pub mod block;
pub mod error;
pub mod fork;
pub mod kv;
pub mod managers;
pub mod receipt;
pub mod remote;
pub mod state_db;
pub mod transaction;
pub mod trie;
pub mod trie_store;

pub use error::StateError;

/// Like `#[serde(with = "::hex")]`, but tolerates and emits leading `0x`
/// prefixes
pub mod serde_hex {
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: hex::ToHex,
    {
        let s = data.encode_hex::<String>();
        serializer.serialize_str(&format!("0x{}", s))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, T>(deserializer: D) -> Result<T, D::Error>
    where
        T: hex::FromHex,
        T::Error: std::fmt::Display,
    {
        let s = String::deserialize(deserializer)?;
        match s.strip_prefix("0x") {
            Some(rest) => T::from_hex(rest),
            None => T::from_hex(&*s),
        }
        .map_err(D::Error::custom)
    }
}
