//! Chain configuration.

use std::time::Duration;

use ethereum_types::{Address, U256};
use simchain_common::{eth_to_wei, gwei_to_wei};
use url::Url;

/// Base fee change bound: a block may move it by at most 1/8th.
pub const BASE_FEE_MAX_CHANGE_DENOMINATOR: u64 = 8;
/// Ratio of the gas limit to the gas target.
pub const ELASTICITY_MULTIPLIER: u64 = 2;

/// When a transaction admitted in instamine mode is reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstamineMode {
    /// The caller waits until the transaction is mined.
    Eager,
    /// The caller gets the hash as soon as the transaction is pooled.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningMode {
    /// One block per executable transaction, as soon as it is admitted.
    Instamine(InstamineMode),
    /// One block per interval holding as many transactions as fit.
    Interval(Duration),
}

/// How block timestamps advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeIncrement {
    /// Wall clock plus the accumulated offset.
    Clock,
    /// Every block is this many seconds after its parent.
    Fixed(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub block_gas_limit: u64,
    /// Gas limit given to transactions that do not carry one.
    pub default_transaction_gas_limit: u64,
    /// Price given to transactions that do not carry a fee.
    pub default_gas_price: U256,
    /// Fee caps below this are refused at admission.
    pub min_gas_price: U256,
    /// Base fee of the genesis block.
    pub initial_base_fee: U256,
    /// Minimum increase, in percent, for a replacement transaction.
    pub price_bump: u64,
    pub mining: MiningMode,
    pub time_increment: TimeIncrement,
    /// Genesis timestamp. Defaults to the current time.
    pub start_time: Option<u64>,
    pub coinbase: Address,
    /// Surface failed execution of mined transactions as errors to the
    /// submitter.
    pub vm_error_on_transaction_failure: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            block_gas_limit: 30_000_000,
            default_transaction_gas_limit: 90_000,
            default_gas_price: gwei_to_wei(2.into()),
            min_gas_price: U256::zero(),
            initial_base_fee: gwei_to_wei(1.into()),
            price_bump: 10,
            mining: MiningMode::Instamine(InstamineMode::Eager),
            time_increment: TimeIncrement::Clock,
            start_time: None,
            coinbase: Address::zero(),
            vm_error_on_transaction_failure: false,
        }
    }
}

impl ChainConfig {
    pub const fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub const fn with_block_gas_limit(mut self, block_gas_limit: u64) -> Self {
        self.block_gas_limit = block_gas_limit;
        self
    }

    pub const fn with_default_transaction_gas_limit(mut self, gas_limit: u64) -> Self {
        self.default_transaction_gas_limit = gas_limit;
        self
    }

    pub const fn with_default_gas_price(mut self, price: U256) -> Self {
        self.default_gas_price = price;
        self
    }

    pub const fn with_min_gas_price(mut self, price: U256) -> Self {
        self.min_gas_price = price;
        self
    }

    pub const fn with_initial_base_fee(mut self, base_fee: U256) -> Self {
        self.initial_base_fee = base_fee;
        self
    }

    pub const fn with_price_bump(mut self, percent: u64) -> Self {
        self.price_bump = percent;
        self
    }

    pub const fn with_mining(mut self, mining: MiningMode) -> Self {
        self.mining = mining;
        self
    }

    pub const fn with_time_increment(mut self, increment: TimeIncrement) -> Self {
        self.time_increment = increment;
        self
    }

    pub const fn with_start_time(mut self, timestamp: u64) -> Self {
        self.start_time = Some(timestamp);
        self
    }

    pub const fn with_coinbase(mut self, coinbase: Address) -> Self {
        self.coinbase = coinbase;
        self
    }

    pub const fn with_vm_error_on_transaction_failure(mut self, enabled: bool) -> Self {
        self.vm_error_on_transaction_failure = enabled;
        self
    }

    pub const fn is_eager(&self) -> bool {
        matches!(self.mining, MiningMode::Instamine(InstamineMode::Eager))
    }
}

/// Where and how to reach the chain being forked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkConfig {
    pub url: Url,
    /// Block to pin. Defaults to the remote's latest.
    pub block_number: Option<u64>,
    /// Backoff between retried requests, in milliseconds.
    pub backoff: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletConfig {
    pub total_accounts: usize,
    pub default_balance: U256,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            total_accounts: 10,
            default_balance: eth_to_wei(1000.into()),
        }
    }
}

/// Base fee of the block after one with `base_fee` that used `gas_used` of
/// `gas_limit` (EIP-1559).
pub fn next_base_fee(base_fee: U256, gas_used: u64, gas_limit: u64) -> U256 {
    let target = gas_limit / ELASTICITY_MULTIPLIER;
    if target == 0 || gas_used == target {
        return base_fee;
    }
    let denominator = U256::from(target) * BASE_FEE_MAX_CHANGE_DENOMINATOR;
    if gas_used > target {
        let delta = base_fee * (gas_used - target) / denominator;
        base_fee.saturating_add(delta.max(U256::one()))
    } else {
        let delta = base_fee * (target - gas_used) / denominator;
        base_fee.saturating_sub(delta)
    }
}
