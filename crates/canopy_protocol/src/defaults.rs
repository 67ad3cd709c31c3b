//! Canonical default values shared by the sentinel and the workers.

use std::time::Duration;

pub const DEFAULT_STATE_STORE_URL: &str = "sqlite:canopy.sqlite";
pub const DEFAULT_OBJECT_STORE_DIR: &str = "artifacts";

/// Suffix appended to a plugin id to form its work queue name.
pub const QUEUE_SUFFIX: &str = "_compute";

/// Time-to-live of a dispatch message before it is dead-lettered.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(5 * 60);
/// Interval between worker heartbeats while a computation is STARTED.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// A STARTED computation without a heartbeat for this long is failed.
pub const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(10);
/// Claimed-but-unacknowledged messages are redelivered after this long.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
/// QUEUED computations older than this with no message anywhere are expired.
pub const DEFAULT_ORPHAN_MAX_AGE: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_FEED_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_FEED_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_CONCURRENT_COMPUTATIONS: usize = 1;

/// Quantization step (degrees) applied to AOI coordinates before fingerprinting.
pub const COORDINATE_TOLERANCE: f64 = 1e-9;

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
pub const INTERNAL_ERROR_MESSAGE: &str = "The computation failed due to an internal error";
pub const EXPIRED_MESSAGE: &str = "The request expired before a worker picked it up";
pub const NO_ARTIFACTS_PREFIX: &str =
    "Failed to create any artifacts due to the following errors: ";
pub const DISPATCH_FAILED_MESSAGE: &str = "The computation could not be dispatched";

pub fn timeout_message(grace: Duration) -> String {
    format!(
        "The computation timed out: no heartbeat received within {}s",
        grace.as_secs_f64()
    )
}
