use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp, RlpStream};
use simchain_common::intrinsic_gas;

pub const LEGACY_TX_TYPE: u8 = 0;
pub const EIP1559_TX_TYPE: u8 = 2;

/// Fee model of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fee {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl Fee {
    pub const fn tx_type(&self) -> u8 {
        match self {
            Fee::Legacy { .. } => LEGACY_TX_TYPE,
            Fee::Eip1559 { .. } => EIP1559_TX_TYPE,
        }
    }

    /// Upper bound of what is paid per gas.
    pub const fn max_fee(&self) -> U256 {
        match *self {
            Fee::Legacy { gas_price } => gas_price,
            Fee::Eip1559 {
                max_fee_per_gas, ..
            } => max_fee_per_gas,
        }
    }

    /// The priority fee offered. Legacy transactions offer their whole price.
    pub const fn tip(&self) -> U256 {
        match *self {
            Fee::Legacy { gas_price } => gas_price,
            Fee::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => max_priority_fee_per_gas,
        }
    }

    /// Price per gas actually paid in a block with `base_fee`.
    pub fn effective_gas_price(&self, base_fee: Option<U256>) -> U256 {
        match *self {
            Fee::Legacy { gas_price } => gas_price,
            Fee::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let base_fee = base_fee.unwrap_or_default();
                max_fee_per_gas.min(base_fee.saturating_add(max_priority_fee_per_gas))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// A transaction submitted for admission or simulation. Missing fields are
/// filled in by whoever consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: Option<u64>,
    pub fee: Option<Fee>,
    pub gas_limit: Option<u64>,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: Option<u64>,
    pub signature: Option<Signature>,
}

/// A fully specified transaction that has not been signed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub from: Address,
    pub nonce: u64,
    pub fee: Fee,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl UnsignedTransaction {
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    pub fn intrinsic_gas(&self) -> u64 {
        intrinsic_gas(&self.data, self.is_create())
    }

    /// The bytes a signer commits to: the EIP-155 list for legacy
    /// transactions, the EIP-2718 typed payload otherwise.
    pub fn signing_payload(&self) -> Vec<u8> {
        match self.fee {
            Fee::Legacy { gas_price } => {
                let mut s = RlpStream::new_list(9);
                s.append(&self.nonce);
                s.append(&gas_price);
                s.append(&self.gas_limit);
                append_to(&mut s, self.to);
                s.append(&self.value);
                s.append(&self.data);
                s.append(&self.chain_id);
                s.append(&0u8);
                s.append(&0u8);
                s.out().to_vec()
            }
            Fee::Eip1559 { .. } => {
                let mut s = RlpStream::new_list(9);
                self.append_eip1559_fields(&mut s);
                typed(EIP1559_TX_TYPE, &s.out())
            }
        }
    }

    pub fn signing_hash(&self) -> H256 {
        keccak(self.signing_payload())
    }

    /// A deterministic stand-in signature for senders whose keys are unknown.
    ///
    /// `r` commits to the signing payload, so two transactions that differ in
    /// any field never share a hash.
    pub fn fake_signature(&self) -> Signature {
        let v = match self.fee {
            Fee::Legacy { .. } => self.chain_id.saturating_mul(2).saturating_add(35),
            Fee::Eip1559 { .. } => 0,
        };
        Signature {
            v,
            r: U256::from_big_endian(self.signing_hash().as_bytes()),
            s: U256::from_big_endian(keccak(self.from).as_bytes()),
        }
    }

    pub fn into_signed(self, signature: Signature) -> Transaction {
        let mut tx = Transaction {
            from: self.from,
            nonce: self.nonce,
            fee: self.fee,
            gas_limit: self.gas_limit,
            to: self.to,
            value: self.value,
            data: self.data,
            chain_id: self.chain_id,
            signature,
            hash: H256::zero(),
        };
        tx.hash = keccak(tx.raw());
        tx
    }

    fn append_eip1559_fields(&self, s: &mut RlpStream) {
        s.append(&self.chain_id);
        s.append(&self.nonce);
        s.append(&self.fee.tip());
        s.append(&self.fee.max_fee());
        s.append(&self.gas_limit);
        append_to(s, self.to);
        s.append(&self.value);
        s.append(&self.data);
        // Access lists are not modelled.
        s.begin_list(0);
    }
}

/// A signed transaction. Its hash is the `keccak` of [`Transaction::raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub from: Address,
    pub nonce: u64,
    pub fee: Fee,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
    pub signature: Signature,
    pub hash: H256,
}

impl Transaction {
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    pub fn intrinsic_gas(&self) -> u64 {
        intrinsic_gas(&self.data, self.is_create())
    }

    pub const fn tx_type(&self) -> u8 {
        self.fee.tx_type()
    }

    pub fn unsigned(&self) -> UnsignedTransaction {
        UnsignedTransaction {
            from: self.from,
            nonce: self.nonce,
            fee: self.fee,
            gas_limit: self.gas_limit,
            to: self.to,
            value: self.value,
            data: self.data.clone(),
            chain_id: self.chain_id,
        }
    }

    /// Consensus encoding, as placed in the transactions trie.
    pub fn raw(&self) -> Vec<u8> {
        let Signature { v, r, s: sig_s } = self.signature;
        match self.fee {
            Fee::Legacy { gas_price } => {
                let mut s = RlpStream::new_list(9);
                s.append(&self.nonce);
                s.append(&gas_price);
                s.append(&self.gas_limit);
                append_to(&mut s, self.to);
                s.append(&self.value);
                s.append(&self.data);
                s.append(&v);
                s.append(&r);
                s.append(&sig_s);
                s.out().to_vec()
            }
            Fee::Eip1559 { .. } => {
                let mut s = RlpStream::new_list(12);
                self.unsigned().append_eip1559_fields(&mut s);
                s.append(&v);
                s.append(&r);
                s.append(&sig_s);
                typed(EIP1559_TX_TYPE, &s.out())
            }
        }
    }

    /// Inverse of [`Transaction::raw`]. The sender is not recoverable from
    /// simulated signatures, so it is supplied by the caller.
    pub fn decode_raw(raw: &[u8], from: Address) -> Result<Self, DecoderError> {
        let first = *raw.first().ok_or(DecoderError::RlpIsTooShort)?;
        let tx = if first == EIP1559_TX_TYPE {
            let rlp = Rlp::new(&raw[1..]);
            if rlp.item_count()? != 12 {
                return Err(DecoderError::RlpIncorrectListLen);
            }
            Transaction {
                from,
                chain_id: rlp.val_at(0)?,
                nonce: rlp.val_at(1)?,
                fee: Fee::Eip1559 {
                    max_priority_fee_per_gas: rlp.val_at(2)?,
                    max_fee_per_gas: rlp.val_at(3)?,
                },
                gas_limit: rlp.val_at(4)?,
                to: decode_to(&rlp.at(5)?)?,
                value: rlp.val_at(6)?,
                data: rlp.val_at(7)?,
                signature: Signature {
                    v: rlp.val_at(9)?,
                    r: rlp.val_at(10)?,
                    s: rlp.val_at(11)?,
                },
                hash: keccak(raw),
            }
        } else if first >= 0xc0 {
            let rlp = Rlp::new(raw);
            if rlp.item_count()? != 9 {
                return Err(DecoderError::RlpIncorrectListLen);
            }
            let v: u64 = rlp.val_at(6)?;
            Transaction {
                from,
                nonce: rlp.val_at(0)?,
                fee: Fee::Legacy {
                    gas_price: rlp.val_at(1)?,
                },
                gas_limit: rlp.val_at(2)?,
                to: decode_to(&rlp.at(3)?)?,
                value: rlp.val_at(4)?,
                data: rlp.val_at(5)?,
                chain_id: if v >= 35 { (v - 35) / 2 } else { 0 },
                signature: Signature {
                    v,
                    r: rlp.val_at(7)?,
                    s: rlp.val_at(8)?,
                },
                hash: keccak(raw),
            }
        } else {
            return Err(DecoderError::Custom("unsupported transaction type"));
        };
        Ok(tx)
    }
}

fn append_to(s: &mut RlpStream, to: Option<Address>) {
    match to {
        Some(address) => s.append(&address),
        None => s.append_empty_data(),
    };
}

fn decode_to(rlp: &Rlp) -> Result<Option<Address>, DecoderError> {
    if rlp.is_empty() {
        Ok(None)
    } else {
        rlp.as_val().map(Some)
    }
}

fn typed(tx_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(tx_type);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn unsigned(fee: Fee) -> UnsignedTransaction {
        UnsignedTransaction {
            from: Address::repeat_byte(0x11),
            nonce: 7,
            fee,
            gas_limit: 21_000,
            to: Some(Address::repeat_byte(0x22)),
            value: 1_000.into(),
            data: vec![0xde, 0xad],
            chain_id: 1337,
        }
    }

    #[test]
    fn effective_gas_price_is_capped() {
        let fee = Fee::Eip1559 {
            max_fee_per_gas: 100.into(),
            max_priority_fee_per_gas: 10.into(),
        };
        assert_eq!(fee.effective_gas_price(Some(50.into())), 60.into());
        assert_eq!(fee.effective_gas_price(Some(95.into())), 100.into());
        let legacy = Fee::Legacy {
            gas_price: 42.into(),
        };
        assert_eq!(legacy.effective_gas_price(Some(95.into())), 42.into());
    }

    #[test]
    fn raw_encoding_decodes_back() {
        for fee in [
            Fee::Legacy {
                gas_price: 2_000_000_000u64.into(),
            },
            Fee::Eip1559 {
                max_fee_per_gas: 3.into(),
                max_priority_fee_per_gas: 1.into(),
            },
        ] {
            let tx = unsigned(fee);
            let signature = tx.fake_signature();
            let signed = tx.into_signed(signature);
            let decoded = Transaction::decode_raw(&signed.raw(), signed.from).unwrap();
            assert_eq!(decoded, signed);
        }
    }

    #[test]
    fn creation_has_empty_recipient() {
        let mut tx = unsigned(Fee::Legacy {
            gas_price: 1.into(),
        });
        tx.to = None;
        tx.gas_limit = 100_000;
        let signed = tx.clone().into_signed(tx.fake_signature());
        let decoded = Transaction::decode_raw(&signed.raw(), signed.from).unwrap();
        assert_eq!(decoded.to, None);
        assert!(decoded.is_create());
    }

    #[test]
    fn fake_signatures_are_unique_per_nonce() {
        let a = unsigned(Fee::Legacy {
            gas_price: 1.into(),
        });
        let mut b = a.clone();
        b.nonce += 1;
        let a = a.clone().into_signed(a.fake_signature());
        let b = b.clone().into_signed(b.fake_signature());
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.signature.v, 1337 * 2 + 35);
    }

    #[test]
    fn fake_signature_saturates_huge_chain_ids() {
        let mut tx = unsigned(Fee::Legacy {
            gas_price: 1.into(),
        });
        tx.chain_id = u64::MAX / 2;
        assert_eq!(tx.fake_signature().v, u64::MAX);
    }

    #[test]
    fn typed_payload_carries_type_byte() {
        let tx = unsigned(Fee::Eip1559 {
            max_fee_per_gas: 3.into(),
            max_priority_fee_per_gas: 1.into(),
        });
        assert_eq!(tx.signing_payload()[0], EIP1559_TX_TYPE);
        assert_eq!(
            Transaction::decode_raw(&hex!("01c0"), Address::zero()),
            Err(DecoderError::Custom("unsupported transaction type"))
        );
    }
}
