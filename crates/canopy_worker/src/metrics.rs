//! Worker counters.
//!
//! Lock-free atomics, read through [`Metrics::snapshot`] for periodic logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub deliveries_received: AtomicU64,
    pub deliveries_ignored: AtomicU64,
    pub computations_started: AtomicU64,
    pub computations_succeeded: AtomicU64,
    pub computations_failed: AtomicU64,
    /// Finished after the sentinel had already moved the computation on.
    pub computations_lost: AtomicU64,
    pub artifacts_uploaded: AtomicU64,
    pub artifact_warnings: AtomicU64,
    pub compute_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            deliveries_received: AtomicU64::new(0),
            deliveries_ignored: AtomicU64::new(0),
            computations_started: AtomicU64::new(0),
            computations_succeeded: AtomicU64::new(0),
            computations_failed: AtomicU64::new(0),
            computations_lost: AtomicU64::new(0),
            artifacts_uploaded: AtomicU64::new(0),
            artifact_warnings: AtomicU64::new(0),
            compute_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_deliveries_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_deliveries_ignored(&self) {
        self.deliveries_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_computations_started(&self) {
        self.computations_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_computations_succeeded(&self) {
        self.computations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_computations_failed(&self) {
        self.computations_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_computations_lost(&self) {
        self.computations_lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_artifacts_uploaded(&self, count: u64) {
        self.artifacts_uploaded.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_artifact_warnings(&self, count: u64) {
        self.artifact_warnings.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_compute_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.compute_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deliveries_received: self.deliveries_received.load(Ordering::Relaxed),
            deliveries_ignored: self.deliveries_ignored.load(Ordering::Relaxed),
            computations_started: self.computations_started.load(Ordering::Relaxed),
            computations_succeeded: self.computations_succeeded.load(Ordering::Relaxed),
            computations_failed: self.computations_failed.load(Ordering::Relaxed),
            computations_lost: self.computations_lost.load(Ordering::Relaxed),
            artifacts_uploaded: self.artifacts_uploaded.load(Ordering::Relaxed),
            artifact_warnings: self.artifact_warnings.load(Ordering::Relaxed),
            compute_time_us: self.compute_time_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub deliveries_received: u64,
    pub deliveries_ignored: u64,
    pub computations_started: u64,
    pub computations_succeeded: u64,
    pub computations_failed: u64,
    pub computations_lost: u64,
    pub artifacts_uploaded: u64,
    pub artifact_warnings: u64,
    pub compute_time_us: u64,
}

impl MetricsSnapshot {
    pub fn avg_compute_time_ms(&self) -> f64 {
        let finished = self.computations_succeeded + self.computations_failed + self.computations_lost;
        if finished == 0 {
            0.0
        } else {
            (self.compute_time_us as f64 / finished as f64) / 1000.0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "started={} succeeded={} failed={} lost={} artifacts={} warnings={} ignored={} avg_compute={:.1}ms",
            self.computations_started,
            self.computations_succeeded,
            self.computations_failed,
            self.computations_lost,
            self.artifacts_uploaded,
            self.artifact_warnings,
            self.deliveries_ignored,
            self.avg_compute_time_ms(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_summary() {
        let metrics = Metrics::new();
        metrics.inc_computations_started();
        metrics.inc_computations_succeeded();
        metrics.add_artifacts_uploaded(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.computations_succeeded, 1);
        assert_eq!(snapshot.artifacts_uploaded, 3);
        assert!(snapshot.summary().contains("artifacts=3"));
    }

    #[test]
    fn test_avg_compute_time_without_computations() {
        assert_eq!(Metrics::new().snapshot().avg_compute_time_ms(), 0.0);
    }
}
