use std::time::Duration;

use canopy_protocol::defaults;

/// Sentinel configuration (plain data).
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// When false every submission gets a fresh computation.
    pub deduplicate: bool,
    pub message_ttl: Duration,
    pub reaper_interval: Duration,
    pub heartbeat_grace: Duration,
    pub visibility_timeout: Duration,
    pub orphan_max_age: Duration,
    pub feed_poll_interval: Duration,
    pub feed_heartbeat_interval: Duration,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            deduplicate: true,
            message_ttl: defaults::DEFAULT_MESSAGE_TTL,
            reaper_interval: defaults::DEFAULT_REAPER_INTERVAL,
            heartbeat_grace: defaults::DEFAULT_HEARTBEAT_GRACE,
            visibility_timeout: defaults::DEFAULT_VISIBILITY_TIMEOUT,
            orphan_max_age: defaults::DEFAULT_ORPHAN_MAX_AGE,
            feed_poll_interval: defaults::DEFAULT_FEED_POLL_INTERVAL,
            feed_heartbeat_interval: defaults::DEFAULT_FEED_HEARTBEAT_INTERVAL,
        }
    }
}
