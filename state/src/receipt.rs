use ethereum_types::{Address, Bloom, BloomInput, H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::transaction::LEGACY_TX_TYPE;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

impl Log {
    pub fn accrue_bloom(&self, bloom: &mut Bloom) {
        bloom.accrue(BloomInput::Raw(self.address.as_bytes()));
        for topic in &self.topics {
            bloom.accrue(BloomInput::Raw(topic.as_bytes()));
        }
    }
}

impl Encodable for Log {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.address);
        s.append_list(&self.topics);
        s.append(&self.data);
    }
}

impl Decodable for Log {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            address: rlp.val_at(0)?,
            topics: rlp.list_at(1)?,
            data: rlp.val_at(2)?,
        })
    }
}

pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::zero();
    for log in logs {
        log.accrue_bloom(&mut bloom);
    }
    bloom
}

/// The consensus part of a receipt, as placed in the receipts trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_type: u8,
    pub status: bool,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn new(tx_type: u8, status: bool, cumulative_gas_used: u64, logs: Vec<Log>) -> Self {
        Self {
            tx_type,
            status,
            cumulative_gas_used,
            logs_bloom: logs_bloom(&logs),
            logs,
        }
    }

    /// RLP encode the receipt and prepend the tx type.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = rlp::encode(self).to_vec();
        if self.tx_type != LEGACY_TX_TYPE {
            bytes.insert(0, self.tx_type);
        }
        bytes
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecoderError> {
        let (tx_type, body) = match raw.first() {
            Some(&t) if t < 0x80 => (t, &raw[1..]),
            Some(_) => (LEGACY_TX_TYPE, raw),
            None => return Err(DecoderError::RlpIsTooShort),
        };
        let rlp = Rlp::new(body);
        Ok(Self {
            tx_type,
            status: rlp.val_at(0)?,
            cumulative_gas_used: rlp.val_at(1)?,
            logs_bloom: rlp.val_at(2)?,
            logs: rlp.list_at(3)?,
        })
    }
}

impl Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.status);
        s.append(&self.cumulative_gas_used);
        s.append(&self.logs_bloom);
        s.append_list(&self.logs);
    }
}

/// A receipt together with everything queries report alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRecord {
    pub receipt: Receipt,
    pub transaction_hash: H256,
    pub transaction_index: u64,
    pub block_hash: H256,
    pub block_number: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub gas_used: u64,
    pub effective_gas_price: U256,
    pub contract_address: Option<Address>,
}

impl ReceiptRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(10);
        s.append(&self.receipt.encode());
        s.append(&self.transaction_hash);
        s.append(&self.transaction_index);
        s.append(&self.block_hash);
        s.append(&self.block_number);
        s.append(&self.from);
        append_optional_address(&mut s, self.to);
        s.append(&self.gas_used);
        s.append(&self.effective_gas_price);
        append_optional_address(&mut s, self.contract_address);
        s.out().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let raw_receipt: Vec<u8> = rlp.val_at(0)?;
        Ok(Self {
            receipt: Receipt::decode(&raw_receipt)?,
            transaction_hash: rlp.val_at(1)?,
            transaction_index: rlp.val_at(2)?,
            block_hash: rlp.val_at(3)?,
            block_number: rlp.val_at(4)?,
            from: rlp.val_at(5)?,
            to: optional_address_at(&rlp, 6)?,
            gas_used: rlp.val_at(7)?,
            effective_gas_price: rlp.val_at(8)?,
            contract_address: optional_address_at(&rlp, 9)?,
        })
    }
}

/// A log as reported by queries, positioned inside its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub log: Log,
    pub block_hash: H256,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub removed: bool,
}

/// Every log emitted in one block, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockLogs {
    pub block_number: u64,
    pub block_hash: H256,
    entries: Vec<(H256, u64, Log)>,
}

impl BlockLogs {
    pub fn new(block_number: u64, block_hash: H256) -> Self {
        Self {
            block_number,
            block_hash,
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, transaction_hash: H256, transaction_index: u64, log: Log) {
        self.entries.push((transaction_hash, transaction_index, log));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = LogEntry> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(log_index, (tx_hash, tx_index, log))| LogEntry {
                log: log.clone(),
                block_hash: self.block_hash,
                block_number: self.block_number,
                transaction_hash: *tx_hash,
                transaction_index: *tx_index,
                log_index: log_index as u64,
                removed: false,
            })
    }

    pub fn filter<'a>(&'a self, filter: &'a LogFilter) -> impl Iterator<Item = LogEntry> + 'a {
        self.entries().filter(|entry| filter.matches(&entry.log))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(3);
        s.append(&self.block_number);
        s.append(&self.block_hash);
        s.begin_list(self.entries.len());
        for (tx_hash, tx_index, log) in &self.entries {
            s.begin_list(3);
            s.append(tx_hash);
            s.append(tx_index);
            s.append(log);
        }
        s.out().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let entries = rlp
            .at(2)?
            .iter()
            .map(|entry| -> Result<(H256, u64, Log), DecoderError> {
                Ok((entry.val_at(0)?, entry.val_at(1)?, entry.val_at(2)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            block_number: rlp.val_at(0)?,
            block_hash: rlp.val_at(1)?,
            entries,
        })
    }
}

/// Address and topic constraints of a log query. An empty address list or a
/// `None` topic position matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Vec<Address>,
    pub topics: Vec<Option<Vec<H256>>>,
}

impl LogFilter {
    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, wanted)| match wanted {
            None => true,
            Some(options) => log
                .topics
                .get(i)
                .is_some_and(|topic| options.is_empty() || options.contains(topic)),
        })
    }
}

fn append_optional_address(s: &mut RlpStream, address: Option<Address>) {
    match address {
        Some(address) => s.append(&address),
        None => s.append_empty_data(),
    };
}

fn optional_address_at(rlp: &Rlp, index: usize) -> Result<Option<Address>, DecoderError> {
    let item = rlp.at(index)?;
    if item.is_empty() {
        Ok(None)
    } else {
        item.as_val().map(Some)
    }
}
