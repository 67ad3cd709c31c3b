//! Messages and records shared between the sentinel, the state store and workers.

use canopy_ids::{ArtifactId, CorrelationId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::aoi::Aoi;
use crate::state::{ComputationState, ErrorKind};

// ============================================================================
// Caching policy
// ============================================================================

/// How long a computation stays eligible for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShelfLife {
    /// Matches forever.
    Forever,
    /// Never matched; every request computes afresh.
    Never,
    /// Matches until `request_timestamp + duration`.
    For(Duration),
}

impl ShelfLife {
    /// `expires_at` (Unix millis) for a computation requested at `now`.
    pub fn expires_at(&self, now: i64) -> i64 {
        match self {
            ShelfLife::Forever => i64::MAX,
            ShelfLife::Never => now,
            ShelfLife::For(d) => {
                now.saturating_add(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            }
        }
    }

    pub fn is_cacheable(&self) -> bool {
        match self {
            ShelfLife::Never => false,
            ShelfLife::For(d) => !d.is_zero(),
            ShelfLife::Forever => true,
        }
    }

    /// Column encoding: NULL = forever, 0 = never, otherwise milliseconds.
    pub fn to_column(&self) -> Option<i64> {
        match self {
            ShelfLife::Forever => None,
            ShelfLife::Never => Some(0),
            ShelfLife::For(d) => Some(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
        }
    }

    pub fn from_column(value: Option<i64>) -> Self {
        match value {
            None => ShelfLife::Forever,
            Some(ms) if ms <= 0 => ShelfLife::Never,
            Some(ms) => ShelfLife::For(Duration::from_millis(ms as u64)),
        }
    }
}

/// Per-request replacement for a plugin's shelf life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheOverride {
    Forever,
    Never,
}

impl CacheOverride {
    pub fn apply(override_: Option<CacheOverride>, plugin_default: ShelfLife) -> ShelfLife {
        match override_ {
            Some(CacheOverride::Forever) => ShelfLife::Forever,
            Some(CacheOverride::Never) => ShelfLife::Never,
            None => plugin_default,
        }
    }
}

/// A plugin as known to the sentinel. Workers publish this on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRegistration {
    pub plugin_id: String,
    pub version: String,
    pub shelf_life: ShelfLife,
    #[serde(default)]
    pub description: String,
}

// ============================================================================
// Dispatch
// ============================================================================

/// Minimal message routed to a plugin's work queue. Never carries results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub correlation_id: CorrelationId,
    pub plugin_id: String,
    pub params: Value,
    pub aoi: Aoi,
}

// ============================================================================
// Read models
// ============================================================================

/// Answer to `get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub correlation_id: CorrelationId,
    pub state: ComputationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Artifact name -> message ("" when the cause is internal).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_warnings: BTreeMap<String, String>,
}

/// Descriptive part of an artifact, filled in by the producing plugin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub filename: String,
    pub content_type: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legend: Option<Value>,
    /// Opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Value>,
}

/// A committed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub computation_id: CorrelationId,
    pub rank: u32,
    pub store_key: String,
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub created_at: DateTime<Utc>,
}

/// One submission, possibly folded into an existing computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub correlation_id: CorrelationId,
    pub requested_at: DateTime<Utc>,
    pub aoi_name: Option<String>,
    pub aoi_id: Option<String>,
}

// ============================================================================
// Status feed
// ============================================================================

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub seq: i64,
    pub correlation_id: CorrelationId,
    pub state: ComputationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Frame pushed to status subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusFrame {
    Event(StatusEvent),
    Heartbeat { at: DateTime<Utc> },
}

impl StatusFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusFrame::Event(event) if event.state.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shelf_life_expiry() {
        assert_eq!(ShelfLife::Forever.expires_at(10), i64::MAX);
        assert_eq!(ShelfLife::Never.expires_at(10), 10);
        assert_eq!(ShelfLife::For(Duration::from_secs(1)).expires_at(10), 1010);
    }

    #[test]
    fn shelf_life_column_encoding() {
        for life in [
            ShelfLife::Forever,
            ShelfLife::Never,
            ShelfLife::For(Duration::from_millis(1500)),
        ] {
            assert_eq!(ShelfLife::from_column(life.to_column()), life);
        }
    }

    #[test]
    fn zero_duration_is_not_cacheable() {
        assert!(!ShelfLife::For(Duration::ZERO).is_cacheable());
        assert!(ShelfLife::Forever.is_cacheable());
    }

    #[test]
    fn override_replaces_plugin_default() {
        let default = ShelfLife::For(Duration::from_secs(60));
        assert_eq!(CacheOverride::apply(None, default), default);
        assert_eq!(
            CacheOverride::apply(Some(CacheOverride::Never), default),
            ShelfLife::Never
        );
    }

    #[test]
    fn heartbeat_frame_serializes_with_tag() {
        let frame = StatusFrame::Heartbeat {
            at: DateTime::from_timestamp_millis(0).unwrap_or_default(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(!frame.is_terminal());
    }
}
