//! Canopy worker runtime.
//!
//! Consumes the work queue of one plugin, runs each computation through its
//! [`Plugin`] implementation and reports the outcome to the state store.

pub mod artifact;
pub mod demo;
mod error;
pub mod metrics;
pub mod object_store;
pub mod plugin;
pub mod registry;
pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

use canopy_protocol::defaults;

pub use artifact::{ArtifactDraft, ArtifactStage};
pub use tokio_util::sync::CancellationToken;
pub use error::{Result, WorkerError};
pub use metrics::METRICS;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, StoreRef};
pub use plugin::{ArtifactOutput, ComputeContext, Plugin, PluginError};
pub use registry::PluginRegistry;
pub use worker::{RunOutcome, Worker, WorkerConfig, WorkerHandle};

#[derive(clap::Parser, Debug)]
#[command(name = "canopy-worker", about = "Canopy computation worker")]
pub struct WorkerArgs {
    /// Plugin whose queue this worker consumes
    #[arg(long, env = "CANOPY_PLUGIN", default_value = demo::ECHO_PLUGIN_ID)]
    pub plugin: String,

    /// State store URL
    #[arg(
        long,
        env = "CANOPY_STATE_STORE",
        default_value_t = defaults::DEFAULT_STATE_STORE_URL.to_string()
    )]
    pub state_store: String,

    /// Directory artifacts are uploaded to
    #[arg(long, env = "CANOPY_OBJECT_STORE", default_value = defaults::DEFAULT_OBJECT_STORE_DIR)]
    pub object_store: PathBuf,

    /// Worker name (generated if not provided)
    #[arg(long)]
    pub worker_name: Option<String>,

    /// Computations run at the same time
    #[arg(
        long,
        env = "CANOPY_MAX_CONCURRENT",
        default_value_t = defaults::DEFAULT_MAX_CONCURRENT_COMPUTATIONS
    )]
    pub max_concurrent: usize,

    /// Seconds between heartbeats of a running computation
    #[arg(long, default_value_t = defaults::DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    pub heartbeat_interval_secs: u64,

    /// Milliseconds between queue polls when idle
    #[arg(long, default_value_t = defaults::DEFAULT_WORKER_POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,

    /// Debug logging on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl WorkerArgs {
    pub fn to_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::new(&self.plugin);
        if let Some(name) = &self.worker_name {
            config.worker_name = name.clone();
        }
        config.max_concurrent = self.max_concurrent;
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs);
        config.poll_interval = Duration::from_millis(self.poll_interval_ms);
        config
    }
}
