//! Deterministic development accounts.

use ethereum_types::Address;
use keccak_hash::keccak;

use crate::blockchain::GenesisAccount;
use crate::config::WalletConfig;

const SEED: &[u8] = b"simchain development account";

/// The `index`th development address. The same index always yields the
/// same address.
pub fn account_address(index: usize) -> Address {
    let mut preimage = SEED.to_vec();
    preimage.extend_from_slice(&(index as u64).to_be_bytes());
    Address::from_slice(&keccak(preimage).as_bytes()[12..])
}

/// The accounts funded at genesis.
pub fn genesis_accounts(config: &WalletConfig) -> Vec<GenesisAccount> {
    (0..config.total_accounts)
        .map(|index| GenesisAccount {
            address: account_address(index),
            balance: config.default_balance,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use simchain_common::eth_to_wei;

    use super::*;

    #[test]
    fn accounts_are_stable_and_distinct() {
        let accounts = genesis_accounts(&WalletConfig::default());
        assert_eq!(accounts.len(), 10);
        assert!(accounts.iter().map(|account| account.address).all_unique());
        assert!(accounts
            .iter()
            .all(|account| account.balance == eth_to_wei(1000.into())));
        assert_eq!(accounts[3].address, account_address(3));
    }
}
