use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use simchain::blockchain::Blockchain;
use simchain::cli::{ChainArgs, ForkArgs, MinerArgs, WalletArgs};
use simchain::config::{ChainConfig, WalletConfig};
use simchain::env::load_dotenvy_vars_if_present;
use simchain::executor::TransferExecutor;
use simchain::wallet::genesis_accounts;
use simchain_state::kv::MemoryStore;
use simchain_state::managers::ChainDb;
use simchain_state::remote::{ForkClient, HttpRemote};
use simchain_state::trie::TrieDb;
use tracing::info;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    chain: ChainArgs,
    #[command(flatten)]
    miner: MinerArgs,
    #[command(flatten)]
    fork: ForkArgs,
    #[command(flatten)]
    wallet: WalletArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    simchain::tracing::init();

    let args = Cli::parse();
    let config = ChainConfig::from((args.chain, args.miner));
    let wallet = WalletConfig::from(args.wallet);

    let fork = match args.fork.into_config() {
        Some(fork) => {
            let remote = Arc::new(HttpRemote::new(fork.url, fork.backoff, fork.max_retries));
            Some(Arc::new(ForkClient::connect(remote, fork.block_number).await?))
        }
        None => None,
    };
    let db = Arc::new(ChainDb::new(
        Arc::new(MemoryStore::new()),
        TrieDb::new(),
        fork,
    ));
    let chain = Blockchain::new(config, Arc::new(TransferExecutor), db);

    let accounts = genesis_accounts(&wallet);
    chain.initialize(&accounts).await?;
    for (index, account) in accounts.iter().enumerate() {
        info!(index, address = ?account.address, balance = %account.balance, "funded account");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    chain.stop().await?;
    Ok(())
}
