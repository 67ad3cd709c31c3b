//! Canopy sentinel library
//!
//! Request admission (fingerprint, dedup, dispatch), the reaper and the
//! status feed, behind the [`Sentinel`] facade.

pub mod config;
mod error;
pub mod feed;
pub mod metrics;
pub mod reaper;
pub mod resolver;
pub mod router;
pub mod sentinel;

use std::time::Duration;

use canopy_protocol::defaults;

pub use config::SentinelConfig;
pub use error::{Result, SentinelError};
pub use feed::StatusFeed;
pub use metrics::METRICS;
pub use reaper::{Reaper, ReaperReport};
pub use resolver::{DedupResolver, SubmitRequest};
pub use router::QueueRouter;
pub use sentinel::Sentinel;

#[derive(clap::Parser, Debug)]
#[command(name = "canopy-sentinel", about = "Canopy sentinel: reaper and heartbeat watchdog")]
pub struct SentinelArgs {
    /// State store URL (sqlite:/path/to/state.sqlite)
    #[arg(
        long,
        env = "CANOPY_STATE_STORE",
        default_value_t = defaults::DEFAULT_STATE_STORE_URL.to_string()
    )]
    pub state_store: String,

    /// Seconds between reaper passes
    #[arg(long, env = "CANOPY_REAPER_INTERVAL", default_value_t = defaults::DEFAULT_REAPER_INTERVAL.as_secs())]
    pub reaper_interval_secs: u64,

    /// Seconds without heartbeat before a running computation fails
    #[arg(long, env = "CANOPY_HEARTBEAT_GRACE", default_value_t = defaults::DEFAULT_HEARTBEAT_GRACE.as_secs())]
    pub heartbeat_grace_secs: u64,

    /// Seconds a dispatch message may wait before it is dead-lettered
    #[arg(long, env = "CANOPY_MESSAGE_TTL", default_value_t = defaults::DEFAULT_MESSAGE_TTL.as_secs())]
    pub message_ttl_secs: u64,

    /// Seconds before an unacknowledged message is redelivered
    #[arg(long, default_value_t = defaults::DEFAULT_VISIBILITY_TIMEOUT.as_secs())]
    pub visibility_timeout_secs: u64,

    /// Disable request deduplication
    #[arg(long)]
    pub no_dedup: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl SentinelArgs {
    pub fn to_config(&self) -> SentinelConfig {
        SentinelConfig {
            deduplicate: !self.no_dedup,
            message_ttl: Duration::from_secs(self.message_ttl_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            heartbeat_grace: Duration::from_secs(self.heartbeat_grace_secs),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            ..SentinelConfig::default()
        }
    }
}
