//! Strata Server
//!
//! Opens the storage engine and serves the HTTP API until Ctrl+C or
//! SIGTERM, then flushes everything to disk.
//!
//! Run with: cargo run --bin strata -- --config config.toml

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strata::api::{serve, AppState};
use strata::config::{init_tracing, Config};
use strata::ingest::Importer;
use strata::storage::StorageEngine;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Time-series storage server")]
struct Args {
    /// Config file (default: standard locations, then environment only)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(long)]
    data_dir: Option<String>,

    /// Port to listen on, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    init_tracing(&config.logging);
    tracing::info!("Starting Strata v{}", env!("CARGO_PKG_VERSION"));

    let storage_config = config.storage_config();
    tracing::info!("Data directory: {:?}", storage_config.data_dir);

    let storage = tokio::task::spawn_blocking(move || StorageEngine::open(storage_config)).await??;
    let storage = Arc::new(storage);
    let importer = Arc::new(Importer::new(Arc::clone(&storage), config.importer_config())?);

    let api_config = config.api_config();
    let state = AppState::new(Arc::clone(&storage), importer, api_config.clone());
    let served = serve(state, &api_config).await;

    tracing::info!("Shutting down storage engine...");
    tokio::task::spawn_blocking(move || storage.must_close()).await??;
    tracing::info!("Strata stopped");

    served?;
    Ok(())
}
