//! Canopy sentinel binary.
//!
//! Runs the reaper and heartbeat watchdog against the state store until Ctrl-C.
//!
//! Usage:
//!     canopy-sentinel --state-store sqlite:canopy.sqlite

use anyhow::{Context, Result};
use canopy_logging::{init_logging, LogConfig};
use canopy_sentinel::{Sentinel, SentinelArgs, METRICS};
use canopy_state_store::CanopyContext;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = SentinelArgs::parse();
    init_logging(LogConfig {
        app_name: "canopy-sentinel",
        verbose: args.verbose,
        ..LogConfig::default()
    })?;

    let config = args.to_config();
    info!("Starting Canopy sentinel");
    info!("  State store: {}", args.state_store);
    info!("  Reaper interval: {:?}", config.reaper_interval);
    info!("  Heartbeat grace: {:?}", config.heartbeat_grace);
    info!("  Deduplicate: {}", config.deduplicate);

    let ctx = CanopyContext::open(&args.state_store)
        .await
        .with_context(|| format!("Failed to open state store {}", args.state_store))?;

    let plugins = ctx
        .store
        .plugins()
        .list()
        .await
        .context("Failed to list registered plugins")?;
    for plugin in &plugins {
        info!(
            "  Plugin: {} {} ({:?})",
            plugin.plugin_id, plugin.version, plugin.shelf_life
        );
    }

    let mut sentinel = Sentinel::new(ctx, config);
    sentinel.spawn_reaper();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    sentinel.shutdown().await;
    info!("{}", METRICS.prometheus_format());
    Ok(())
}
