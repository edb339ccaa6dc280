use ethereum_types::{Address, Bloom, H256, H64, U256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use simchain_common::{EMPTY_OMMERS_HASH, EMPTY_TRIE_HASH};

use crate::transaction::Transaction;

/// A London block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: H256,
    pub ommers_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: H256,
    pub nonce: H64,
    pub base_fee_per_gas: Option<U256>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: H256::zero(),
            ommers_hash: EMPTY_OMMERS_HASH,
            coinbase: Address::zero(),
            state_root: EMPTY_TRIE_HASH,
            transactions_root: EMPTY_TRIE_HASH,
            receipts_root: EMPTY_TRIE_HASH,
            logs_bloom: Bloom::zero(),
            difficulty: U256::zero(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_hash: H256::zero(),
            nonce: H64::zero(),
            base_fee_per_gas: None,
        }
    }
}

impl Header {
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(15 + usize::from(self.base_fee_per_gas.is_some()));
        s.append(&self.parent_hash);
        s.append(&self.ommers_hash);
        s.append(&self.coinbase);
        s.append(&self.state_root);
        s.append(&self.transactions_root);
        s.append(&self.receipts_root);
        s.append(&self.logs_bloom);
        s.append(&self.difficulty);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append(&self.extra_data);
        s.append(&self.mix_hash);
        s.append(&self.nonce);
        if let Some(base_fee) = self.base_fee_per_gas {
            s.append(&base_fee);
        }
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let base_fee_per_gas = match rlp.item_count()? {
            15 => None,
            16 => Some(rlp.val_at(15)?),
            _ => return Err(DecoderError::RlpIncorrectListLen),
        };
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            ommers_hash: rlp.val_at(1)?,
            coinbase: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            transactions_root: rlp.val_at(4)?,
            receipts_root: rlp.val_at(5)?,
            logs_bloom: rlp.val_at(6)?,
            difficulty: rlp.val_at(7)?,
            number: rlp.val_at(8)?,
            gas_limit: rlp.val_at(9)?,
            gas_used: rlp.val_at(10)?,
            timestamp: rlp.val_at(11)?,
            extra_data: rlp.val_at(12)?,
            mix_hash: rlp.val_at(13)?,
            nonce: rlp.val_at(14)?,
            base_fee_per_gas,
        })
    }
}

/// A finalized block.
///
/// The hash is fixed at construction: locally produced blocks hash their
/// header, blocks imported from a fork keep the remote hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    hash: H256,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        let hash = header.hash();
        Self {
            header,
            transactions,
            hash,
        }
    }

    pub fn with_hash(header: Header, transactions: Vec<Transaction>, hash: H256) -> Self {
        Self {
            header,
            transactions,
            hash,
        }
    }

    pub const fn hash(&self) -> H256 {
        self.hash
    }

    pub const fn number(&self) -> u64 {
        self.header.number
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(3);
        s.append(&self.header);
        s.append(&self.hash);
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.begin_list(2);
            s.append(&tx.raw());
            s.append(&tx.from);
        }
        s.out().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let transactions = rlp
            .at(2)?
            .iter()
            .map(|item| -> Result<Transaction, DecoderError> {
                let raw: Vec<u8> = item.val_at(0)?;
                Transaction::decode_raw(&raw, item.val_at(1)?)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            header: rlp.val_at(0)?,
            hash: rlp.val_at(1)?,
            transactions,
        })
    }
}

/// A mined transaction together with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub block_hash: H256,
    pub block_number: u64,
    pub index: u64,
}

impl TransactionRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(6);
        s.append(&self.transaction.raw());
        s.append(&self.transaction.from);
        s.append(&self.transaction.hash);
        s.append(&self.block_hash);
        s.append(&self.block_number);
        s.append(&self.index);
        s.out().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let raw: Vec<u8> = rlp.val_at(0)?;
        let mut transaction = Transaction::decode_raw(&raw, rlp.val_at(1)?)?;
        // Imported transactions keep the hash they were given.
        transaction.hash = rlp.val_at(2)?;
        Ok(Self {
            transaction,
            block_hash: rlp.val_at(3)?,
            block_number: rlp.val_at(4)?,
            index: rlp.val_at(5)?,
        })
    }
}

/// Store key of a block number: minimal big-endian bytes, with block `0`
/// under a single zero byte rather than an empty key.
pub fn block_number_key(number: u64) -> Vec<u8> {
    if number == 0 {
        return vec![0];
    }
    let bytes = number.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn block_number_from_key(key: &[u8]) -> Option<u64> {
    if key.is_empty() || key.len() > 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[8 - key.len()..].copy_from_slice(key);
    Some(u64::from_be_bytes(bytes))
}
