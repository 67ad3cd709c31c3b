//! Sentinel counters.
//!
//! Lock-free atomics with a Prometheus text export for scraping.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub computations_submitted: AtomicU64,
    /// Submissions folded into a live computation.
    pub computations_deduplicated: AtomicU64,
    pub computations_cancelled: AtomicU64,
    pub computations_expired: AtomicU64,
    pub computations_timed_out: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub messages_dead_lettered: AtomicU64,
    pub messages_redelivered: AtomicU64,
    pub reaper_ticks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            computations_submitted: AtomicU64::new(0),
            computations_deduplicated: AtomicU64::new(0),
            computations_cancelled: AtomicU64::new(0),
            computations_expired: AtomicU64::new(0),
            computations_timed_out: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            messages_redelivered: AtomicU64::new(0),
            reaper_ticks: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_submitted(&self) {
        self.computations_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_deduplicated(&self) {
        self.computations_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_cancelled(&self) {
        self.computations_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_expired(&self, count: u64) {
        self.computations_expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_timed_out(&self, count: u64) {
        self.computations_timed_out.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dispatch_failures(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_dead_lettered(&self, count: u64) {
        self.messages_dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_redelivered(&self, count: u64) {
        self.messages_redelivered.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reaper_ticks(&self) {
        self.reaper_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            computations_submitted: self.computations_submitted.load(Ordering::Relaxed),
            computations_deduplicated: self.computations_deduplicated.load(Ordering::Relaxed),
            computations_cancelled: self.computations_cancelled.load(Ordering::Relaxed),
            computations_expired: self.computations_expired.load(Ordering::Relaxed),
            computations_timed_out: self.computations_timed_out.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            messages_redelivered: self.messages_redelivered.load(Ordering::Relaxed),
            reaper_ticks: self.reaper_ticks.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format.
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 10] = [
            ("canopy_computations_submitted_total", "Submissions accepted", s.computations_submitted),
            ("canopy_computations_deduplicated_total", "Submissions folded into a live computation", s.computations_deduplicated),
            ("canopy_computations_cancelled_total", "Cancellations applied", s.computations_cancelled),
            ("canopy_computations_expired_total", "Computations expired before a worker claimed them", s.computations_expired),
            ("canopy_computations_timed_out_total", "Computations failed by the heartbeat watchdog", s.computations_timed_out),
            ("canopy_messages_dispatched_total", "Dispatch messages published", s.messages_dispatched),
            ("canopy_dispatch_failures_total", "Dispatch messages that could not be published", s.dispatch_failures),
            ("canopy_messages_dead_lettered_total", "Messages moved to the dead-letter table on TTL", s.messages_dead_lettered),
            ("canopy_messages_redelivered_total", "Claimed messages returned after the visibility timeout", s.messages_redelivered),
            ("canopy_reaper_ticks_total", "Reaper passes", s.reaper_ticks),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, value));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub computations_submitted: u64,
    pub computations_deduplicated: u64,
    pub computations_cancelled: u64,
    pub computations_expired: u64,
    pub computations_timed_out: u64,
    pub messages_dispatched: u64,
    pub dispatch_failures: u64,
    pub messages_dead_lettered: u64,
    pub messages_redelivered: u64,
    pub reaper_ticks: u64,
}

impl MetricsSnapshot {
    /// Share of submissions served by an existing computation.
    pub fn dedup_ratio(&self) -> f64 {
        if self.computations_submitted == 0 {
            0.0
        } else {
            self.computations_deduplicated as f64 / self.computations_submitted as f64
        }
    }
}
