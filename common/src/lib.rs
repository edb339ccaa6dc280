use ethereum_types::{H256, U256};

/// The hash value of an account empty EVM code.
/// 0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470
pub const EMPTY_CODE_HASH: H256 = H256([
    197, 210, 70, 1, 134, 247, 35, 60, 146, 126, 125, 178, 220, 199, 3, 192, 229, 0, 182, 83, 202,
    130, 39, 59, 123, 250, 216, 4, 93, 133, 164, 112,
]);

/// The hash of an empty Merkle Patricia trie.
/// 0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421
pub const EMPTY_TRIE_HASH: H256 = H256([
    86, 232, 31, 23, 27, 204, 85, 166, 255, 131, 69, 230, 146, 192, 248, 110, 91, 72, 224, 27, 153,
    108, 173, 192, 1, 98, 47, 181, 227, 99, 180, 33,
]);

/// The hash of an empty ommers list, `keccak(rlp([]))`.
/// 0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347
pub const EMPTY_OMMERS_HASH: H256 = H256([
    29, 204, 77, 232, 222, 199, 93, 122, 171, 133, 181, 103, 182, 204, 212, 26, 211, 18, 69, 27,
    148, 138, 116, 19, 240, 161, 66, 253, 64, 212, 147, 71,
]);

/// Gas schedule constants charged before any code runs.
pub mod gas {
    /// Base cost of every transaction.
    pub const TX_GAS: u64 = 21_000;
    /// Base cost of a contract creation transaction.
    pub const TX_CREATE_GAS: u64 = 53_000;
    /// Cost per zero byte of calldata.
    pub const TX_DATA_ZERO_GAS: u64 = 4;
    /// Cost per non-zero byte of calldata (EIP-2028).
    pub const TX_DATA_NON_ZERO_GAS: u64 = 16;
    /// Cost per 32-byte word of initcode (EIP-3860).
    pub const INITCODE_WORD_GAS: u64 = 2;
    /// Gas handed to the callee of a value-bearing call on top of what the
    /// caller forwards.
    pub const CALL_STIPEND: u64 = 2_300;
}

/// Gas charged for a transaction before execution: the base cost, the
/// calldata cost and, for creations, the initcode word cost.
pub fn intrinsic_gas(data: &[u8], is_create: bool) -> u64 {
    let base = if is_create {
        gas::TX_CREATE_GAS
    } else {
        gas::TX_GAS
    };
    let zeros = data.iter().filter(|b| **b == 0).count() as u64;
    let non_zeros = data.len() as u64 - zeros;
    let mut total = base + zeros * gas::TX_DATA_ZERO_GAS + non_zeros * gas::TX_DATA_NON_ZERO_GAS;
    if is_create {
        total += (data.len() as u64).div_ceil(32) * gas::INITCODE_WORD_GAS;
    }
    total
}

/// Converts an amount in `ETH` to `wei` units.
pub fn eth_to_wei(eth: U256) -> U256 {
    // 1 ether = 10^18 wei.
    eth * U256::from(10).pow(18.into())
}

/// Converts an amount in `gwei` to `wei` units.
/// This also works for converting `ETH` to `gwei`.
pub fn gwei_to_wei(eth: U256) -> U256 {
    // 1 ether = 10^9 gwei = 10^18 wei.
    eth * U256::from(10).pow(9.into())
}

#[test]
fn test_eth_conversion() {
    assert_eq!(
        eth_to_wei(U256::one()),
        gwei_to_wei(gwei_to_wei(U256::one()))
    );
}

#[test]
fn test_empty_code_hash() {
    assert_eq!(EMPTY_CODE_HASH, keccak_hash::keccak([]));
}

#[test]
fn test_empty_trie_hash() {
    assert_eq!(
        EMPTY_TRIE_HASH,
        keccak_hash::keccak(bytes::Bytes::from_static(&rlp::NULL_RLP))
    );
}

#[test]
fn test_empty_ommers_hash() {
    assert_eq!(
        EMPTY_OMMERS_HASH,
        keccak_hash::keccak(rlp::EMPTY_LIST_RLP)
    );
}

#[test]
fn test_intrinsic_gas() {
    assert_eq!(intrinsic_gas(&[], false), 21_000);
    assert_eq!(intrinsic_gas(&[0, 1, 0, 2], false), 21_000 + 2 * 4 + 2 * 16);
    // 33 bytes of initcode are two words.
    assert_eq!(
        intrinsic_gas(&[1; 33], true),
        53_000 + 33 * 16 + 2 * gas::INITCODE_WORD_GAS
    );
}
