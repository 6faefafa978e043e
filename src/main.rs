//! Entry point: parses CLI flags, loads environment-driven settings, and drives
//! either a bounded batch run or continuous tip-following indexing.

mod amount;
mod config;
mod error;
mod extensions;
mod indexer;
mod model;
mod parser;
mod processor;
mod reorg;
mod repository;
mod rpc;
mod script;
mod utxo;
mod validator;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use log::{error, info};

use config::Settings;
use indexer::Indexer;
use repository::{MongoRepository, Repository};
use rpc::RpcClient;
use utxo::UtxoResolver;

/// Universal BRC-20 indexer.
#[derive(Parser, Debug)]
#[command(name = "brc20-indexer", about = "Consensus-deterministic BRC-20 indexer over a Bitcoin Core RPC feed")]
struct Cli {
    /// Maximum number of blocks to process before exiting; unbounded if omitted.
    #[arg(long)]
    max_blocks: Option<u64>,

    /// Follow the chain tip indefinitely instead of stopping at the current height.
    #[arg(long)]
    continuous: bool,

    /// Run only the indexing loop, skipping any optional surrounding services
    /// (kept for parity with the reference CLI; this binary has no other surface).
    #[arg(long)]
    indexer_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, settings).await {
        Ok(()) => {
            info!("indexer shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal error, halting: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<(), error::IndexerError> {
    if cli.indexer_only {
        info!("running indexer-only mode (no surrounding services in this binary)");
    }

    let rpc = RpcClient::new(&settings.rpc_url, &settings.rpc_user, &settings.rpc_password)?;
    if !rpc.health_check().await {
        return Err(error::IndexerError::Connection(
            "initial rpc health check failed".to_string(),
        ));
    }

    let repo = MongoRepository::new(&settings.mongo_connection_string, &settings.mongo_db_name).await?;
    let rpc = Arc::new(rpc);
    let utxo = UtxoResolver::new(rpc.clone(), bitcoin::Network::Bitcoin);

    let start_height = match repo.get_last_processed_height().await? {
        Some(last) => last + 1,
        None => settings.start_block_height,
    };

    let dyn_repo: &dyn Repository = &repo;
    let indexer = Indexer::new(&rpc, dyn_repo, &utxo, &settings, bitcoin::Network::Bitcoin);

    info!("starting indexer at height {start_height}, continuous={}", cli.continuous);

    if cli.continuous {
        indexer.start_continuous_indexing(start_height, cli.max_blocks).await
    } else {
        indexer.start_indexing(start_height, cli.max_blocks).await
    }
}
