use std::time::Duration;

use clap::{Args, ValueEnum};
use ethereum_types::Address;
use simchain_common::{eth_to_wei, gwei_to_wei};
use url::Url;

use crate::config::{
    ChainConfig, ForkConfig, InstamineMode, MiningMode, TimeIncrement, WalletConfig,
};

const CHAIN_HEADING: &str = "Chain options";
const MINER_HEADING: &str = "Miner options";
const FORK_HEADING: &str = "Fork options";
const WALLET_HEADING: &str = "Wallet options";

#[derive(Args, Clone, Debug)]
pub struct ChainArgs {
    /// Chain id used for signing and replay protection.
    #[arg(long, env = "SIMCHAIN_CHAIN_ID", help_heading = CHAIN_HEADING, default_value_t = 1337)]
    pub chain_id: u64,
    /// Gas limit of every block.
    #[arg(long, env = "SIMCHAIN_GAS_LIMIT", help_heading = CHAIN_HEADING, default_value_t = 30_000_000)]
    pub gas_limit: u64,
    /// Gas limit of transactions submitted without one.
    #[arg(long, env = "SIMCHAIN_DEFAULT_TRANSACTION_GAS_LIMIT", help_heading = CHAIN_HEADING, default_value_t = 90_000)]
    pub default_transaction_gas_limit: u64,
    /// Gas price, in gwei, of transactions submitted without a fee.
    #[arg(long, env = "SIMCHAIN_DEFAULT_GAS_PRICE", help_heading = CHAIN_HEADING, default_value_t = 2)]
    pub default_gas_price: u64,
    /// Lowest fee cap, in gwei, accepted by the pool.
    #[arg(long, env = "SIMCHAIN_MIN_GAS_PRICE", help_heading = CHAIN_HEADING, default_value_t = 0)]
    pub min_gas_price: u64,
    /// Base fee of the genesis block, in gwei.
    #[arg(long, env = "SIMCHAIN_INITIAL_BASE_FEE", help_heading = CHAIN_HEADING, default_value_t = 1)]
    pub initial_base_fee: u64,
    /// Genesis timestamp. Defaults to now.
    #[arg(long, env = "SIMCHAIN_START_TIME", help_heading = CHAIN_HEADING)]
    pub start_time: Option<u64>,
    /// Fixed number of seconds between blocks. Defaults to the wall clock.
    #[arg(long, env = "SIMCHAIN_TIME_INCREMENT", help_heading = CHAIN_HEADING)]
    pub time_increment: Option<u64>,
    /// Report failed execution of mined transactions as errors.
    #[arg(long, env = "SIMCHAIN_VM_ERROR_ON_TRANSACTION_FAILURE", help_heading = CHAIN_HEADING, default_value_t = false)]
    pub vm_error_on_transaction_failure: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Instamine {
    /// Submitters wait until their transaction is mined.
    #[default]
    Eager,
    /// Submitters get the hash once the transaction is pooled.
    Strict,
}

#[derive(Args, Clone, Debug)]
pub struct MinerArgs {
    /// Seconds between blocks. Instamines when not given.
    #[arg(long, env = "SIMCHAIN_BLOCK_TIME", help_heading = MINER_HEADING)]
    pub block_time: Option<u64>,
    #[arg(long, env = "SIMCHAIN_INSTAMINE", help_heading = MINER_HEADING, value_enum, default_value_t = Instamine::Eager)]
    pub instamine: Instamine,
    /// Recipient of priority fees. Defaults to the zero address.
    #[arg(long, env = "SIMCHAIN_COINBASE", help_heading = MINER_HEADING)]
    pub coinbase: Option<Address>,
    /// Minimum price increase, in percent, for a replacement transaction.
    #[arg(long, env = "SIMCHAIN_PRICE_BUMP", help_heading = MINER_HEADING, default_value_t = 10)]
    pub price_bump: u64,
}

#[derive(Args, Clone, Debug)]
pub struct ForkArgs {
    /// JSON-RPC endpoint of the chain to fork.
    #[arg(long = "fork-url", env = "SIMCHAIN_FORK_URL", help_heading = FORK_HEADING)]
    pub url: Option<Url>,
    /// Block to fork from. Defaults to the remote's latest.
    #[arg(long = "fork-block-number", env = "SIMCHAIN_FORK_BLOCK_NUMBER", help_heading = FORK_HEADING)]
    pub block_number: Option<u64>,
    /// Initial backoff before retrying a failed remote request, in
    /// milliseconds. Doubles with every retry.
    #[arg(long, env = "SIMCHAIN_FORK_BACKOFF", help_heading = FORK_HEADING, default_value_t = 0)]
    pub backoff: u64,
    /// Retries of a failed remote request.
    #[arg(long, env = "SIMCHAIN_FORK_MAX_RETRIES", help_heading = FORK_HEADING, default_value_t = 0)]
    pub max_retries: u32,
}

#[derive(Args, Clone, Debug)]
pub struct WalletArgs {
    /// Number of development accounts funded at genesis.
    #[arg(long, env = "SIMCHAIN_TOTAL_ACCOUNTS", help_heading = WALLET_HEADING, default_value_t = 10)]
    pub total_accounts: usize,
    /// Balance of every development account, in ether.
    #[arg(long, env = "SIMCHAIN_DEFAULT_BALANCE", help_heading = WALLET_HEADING, default_value_t = 1000)]
    pub default_balance: u64,
}

impl From<(ChainArgs, MinerArgs)> for ChainConfig {
    fn from((chain, miner): (ChainArgs, MinerArgs)) -> Self {
        let mining = match (miner.block_time, miner.instamine) {
            (Some(seconds), _) => MiningMode::Interval(Duration::from_secs(seconds)),
            (None, Instamine::Eager) => MiningMode::Instamine(InstamineMode::Eager),
            (None, Instamine::Strict) => MiningMode::Instamine(InstamineMode::Strict),
        };
        let time_increment = chain
            .time_increment
            .map_or(TimeIncrement::Clock, TimeIncrement::Fixed);
        let config = ChainConfig::default()
            .with_chain_id(chain.chain_id)
            .with_block_gas_limit(chain.gas_limit)
            .with_default_transaction_gas_limit(chain.default_transaction_gas_limit)
            .with_default_gas_price(gwei_to_wei(chain.default_gas_price.into()))
            .with_min_gas_price(gwei_to_wei(chain.min_gas_price.into()))
            .with_initial_base_fee(gwei_to_wei(chain.initial_base_fee.into()))
            .with_price_bump(miner.price_bump)
            .with_mining(mining)
            .with_time_increment(time_increment)
            .with_coinbase(miner.coinbase.unwrap_or_default())
            .with_vm_error_on_transaction_failure(chain.vm_error_on_transaction_failure);
        match chain.start_time {
            Some(timestamp) => config.with_start_time(timestamp),
            None => config,
        }
    }
}

impl ForkArgs {
    /// `None` unless a fork url is given.
    pub fn into_config(self) -> Option<ForkConfig> {
        Some(ForkConfig {
            url: self.url?,
            block_number: self.block_number,
            backoff: self.backoff,
            max_retries: self.max_retries,
        })
    }
}

impl From<WalletArgs> for WalletConfig {
    fn from(wallet: WalletArgs) -> Self {
        Self {
            total_accounts: wallet.total_accounts,
            default_balance: eth_to_wei(wallet.default_balance.into()),
        }
    }
}
