//! Expiry, dead-letter and heartbeat watchdog passes.
//!
//! Every tick runs, in order:
//! 1. TTL expiry of queued messages, then QUEUED -> EXPIRED for dead letters
//! 2. release of dedup slots whose shelf life passed
//! 3. STARTED -> FAILURE for computations without a recent heartbeat
//! 4. redelivery of claimed messages past the visibility timeout
//! 5. QUEUED -> EXPIRED for old computations whose message is gone
//!
//! Computations and artifacts are never deleted.

use std::sync::Arc;
use std::time::Duration;

use canopy_db::CanopyDb;
use canopy_state_store::{CanopyContext, Result, StateStore, Transport};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SentinelConfig;
use crate::metrics::METRICS;

const MIN_TICK: Duration = Duration::from_millis(1);

/// Counts from one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperReport {
    pub dead_lettered: u64,
    pub expired: u64,
    pub slots_released: u64,
    pub timed_out: u64,
    pub redelivered: u64,
    pub orphans_expired: u64,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        *self == ReaperReport::default()
    }
}

#[derive(Clone)]
pub struct Reaper {
    store: StateStore,
    transport: Arc<dyn Transport>,
    heartbeat_grace: Duration,
    visibility_timeout: Duration,
    orphan_max_age: Duration,
    interval: Duration,
}

impl Reaper {
    /// Sweeps the context's store and its transport.
    pub fn new(ctx: &CanopyContext, config: &SentinelConfig) -> Self {
        Self {
            store: ctx.store.clone(),
            transport: ctx.transport.clone(),
            heartbeat_grace: config.heartbeat_grace,
            visibility_timeout: config.visibility_timeout,
            orphan_max_age: config.orphan_max_age,
            interval: config.reaper_interval,
        }
    }

    /// One pass at `now` (Unix millis).
    pub async fn tick(&self, now: i64) -> Result<ReaperReport> {
        let transport = &self.transport;
        let callbacks = self.store.callbacks();
        let mut report = ReaperReport::default();

        report.dead_lettered = transport.expire_due(now).await?;
        report.expired = callbacks.expire_dead_lettered(now).await?.len() as u64;
        report.slots_released = self
            .store
            .computations()
            .release_expired_slots(now)
            .await?;
        report.timed_out = callbacks
            .timeout_stale(self.heartbeat_grace, now)
            .await?
            .len() as u64;
        report.redelivered = transport
            .redeliver_stale(self.visibility_timeout, now)
            .await?;
        report.orphans_expired = callbacks
            .expire_orphaned(self.orphan_max_age, now)
            .await?
            .len() as u64;

        METRICS.inc_reaper_ticks();
        METRICS.add_dead_lettered(report.dead_lettered);
        METRICS.add_expired(report.expired + report.orphans_expired);
        METRICS.add_timed_out(report.timed_out);
        METRICS.add_redelivered(report.redelivered);

        if report.is_empty() {
            debug!("Reaper pass: nothing to do");
        } else {
            info!(
                dead_lettered = report.dead_lettered,
                expired = report.expired,
                slots_released = report.slots_released,
                timed_out = report.timed_out,
                redelivered = report.redelivered,
                orphans_expired = report.orphans_expired,
                "Reaper pass"
            );
        }
        Ok(report)
    }

    /// Tick every `reaper_interval` until `shutdown` is cancelled.
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Reaper started");
        let mut ticker = tokio::time::interval(self.interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    if let Err(err) = self.tick(CanopyDb::now_millis()).await {
                        error!(error = %err, "Reaper pass failed");
                    }
                }
            }
        }
        info!("Reaper stopped");
    }
}
