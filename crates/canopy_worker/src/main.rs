//! Canopy worker binary.
//!
//! Usage:
//!     canopy-worker --plugin echo --state-store sqlite:canopy.sqlite --object-store ./artifacts

use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_logging::{init_logging, LogConfig};
use canopy_state_store::CanopyContext;
use canopy_worker::{demo, FsObjectStore, Worker, WorkerArgs};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = WorkerArgs::parse();
    init_logging(LogConfig {
        app_name: "canopy-worker",
        verbose: args.verbose,
        ..LogConfig::default()
    })?;

    let config = args.to_config();
    info!("Starting Canopy worker");
    info!("  Plugin: {}", config.plugin_id);
    info!("  Worker: {}", config.worker_name);
    info!("  State store: {}", args.state_store);
    info!("  Object store: {}", args.object_store.display());

    let ctx = CanopyContext::open(&args.state_store)
        .await
        .with_context(|| format!("Failed to open state store {}", args.state_store))?;
    let registry = demo::builtin_registry();
    let object_store = Arc::new(FsObjectStore::new(&args.object_store));

    let handle = Worker::start(ctx.clone(), &registry, object_store, config)
        .await
        .context("Failed to start worker")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    handle.shutdown().await?;
    ctx.shutdown().await;
    Ok(())
}
