//! Crashline read API binary
//!
//! Serves round history, fairness verification and settlement counters over
//! the ledger database.

use clap::Parser;
use crashline::{
    api::{ApiServer, AppState},
    config::ConfigLoader,
    logging::init_tracing,
    CrashResolver, HashChainGenerator, Ledger, LedgerMetrics, LedgerStore,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "crashline-api")]
#[command(about = "Crashline read-only HTTP API", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override api.host
    #[arg(long)]
    host: Option<String>,

    /// Override api.port
    #[arg(long)]
    port: Option<u16>,

    /// Override storage.data_directory
    #[arg(long)]
    db_path: Option<String>,

    /// Allowed CORS origins (comma-separated, use * for all)
    #[arg(long)]
    cors_origins: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(ref path) = args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;

    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(dir) = args.db_path {
        config.storage.data_directory = dir;
    }
    if let Some(origins) = args.cors_origins {
        config.api.allowed_origins = origins.split(',').map(|s| s.trim().to_string()).collect();
    }
    config.storage.clear_on_start = false;
    config.validate()?;

    init_tracing(&config.monitoring.log_filter);

    info!(path = %config.storage.data_directory, "opening ledger database");
    let store = LedgerStore::open(&config.storage)?;
    let resolver = CrashResolver::new(config.chain.instant_bust_modulus);
    let ledger = Ledger::new(store.clone(), resolver, Arc::new(LedgerMetrics::new()));
    let chain = Arc::new(HashChainGenerator::new(store, resolver, config.chain.batch_size));

    let state = Arc::new(AppState {
        ledger,
        chain,
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    ApiServer::new(config.api, state).run().await?;

    Ok(())
}
