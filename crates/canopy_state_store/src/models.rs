//! Row models and operation outcomes.

use std::collections::{BTreeMap, BTreeSet};

use canopy_db::CanopyDb;
use canopy_protocol::{
    Aoi, Artifact, ArtifactId, ArtifactMeta, ComputationState, CorrelationId, ErrorKind,
    Fingerprint, RequestId, StateView,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{Result, StateStoreError};

/// Result of applying a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Computation missing, already terminal, or not in the expected state.
    Ignored,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Outcome of `resolve_or_create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub correlation_id: CorrelationId,
    pub request_id: RequestId,
    /// False when folded into an existing live computation.
    pub created: bool,
}

/// Reply to a worker heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReply {
    /// False once the computation has left STARTED (timed out, cancelled...).
    pub alive: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was QUEUED: message revoked, computation failed as cancelled.
    Revoked,
    /// Is STARTED: the worker sees the request on its next heartbeat.
    Requested,
    AlreadyTerminal(ComputationState),
    NotFound,
}

/// An artifact ready to be committed with its computation's SUCCESS.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub id: ArtifactId,
    pub rank: u32,
    pub store_key: String,
    pub meta: ArtifactMeta,
}

/// Full computation row.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationRecord {
    pub id: CorrelationId,
    pub plugin_id: String,
    pub plugin_version: String,
    pub fingerprint: Fingerprint,
    pub state: ComputationState,
    pub params: Value,
    /// Params as accepted by the plugin, once a worker validated them.
    pub validated_params: Option<Value>,
    pub aoi: Aoi,
    pub aoi_name: Option<String>,
    pub aoi_id: Option<String>,
    pub request_ts: i64,
    pub expires_at: i64,
    pub started_at: Option<i64>,
    pub completion_ts: Option<i64>,
    pub worker_name: Option<String>,
    pub last_heartbeat: Option<i64>,
    pub cancel_requested: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub artifact_warnings: BTreeMap<String, String>,
}

impl ComputationRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let id: String = row.try_get("id")?;
        let state: String = row.try_get("state")?;
        let error_kind: Option<String> = row.try_get("error_kind")?;
        let params: String = row.try_get("params")?;
        let validated_params: Option<String> = row.try_get("validated_params")?;
        let aoi: String = row.try_get("aoi")?;
        let warnings: String = row.try_get("artifact_warnings")?;
        let fingerprint: String = row.try_get("fingerprint")?;

        Ok(Self {
            id: parse_id(&id)?,
            plugin_id: row.try_get("plugin_id")?,
            plugin_version: row.try_get("plugin_version")?,
            fingerprint: Fingerprint::from_hex(fingerprint),
            state: parse_state(&state)?,
            params: serde_json::from_str(&params)?,
            validated_params: validated_params
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            aoi: serde_json::from_str(&aoi)?,
            aoi_name: row.try_get("aoi_name")?,
            aoi_id: row.try_get("aoi_id")?,
            request_ts: row.try_get("request_ts")?,
            expires_at: row.try_get("expires_at")?,
            started_at: row.try_get("started_at")?,
            completion_ts: row.try_get("completion_ts")?,
            worker_name: row.try_get("worker_name")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
            error_kind: error_kind
                .map(|kind| kind.parse::<ErrorKind>().map_err(StateStoreError::corrupt))
                .transpose()?,
            error_message: row.try_get("error_message")?,
            artifact_warnings: serde_json::from_str(&warnings)?,
        })
    }

    /// Eligible for dedup matching at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.state.is_live() && self.expires_at > now
    }

    pub fn state_view(&self) -> StateView {
        StateView {
            correlation_id: self.id.clone(),
            state: self.state,
            error_kind: self.error_kind,
            error_message: self.error_message.clone(),
            artifact_warnings: self.artifact_warnings.clone(),
        }
    }
}

pub(crate) fn artifact_from_row(row: &SqliteRow) -> Result<Artifact> {
    let id: String = row.try_get("id")?;
    let computation_id: String = row.try_get("computation_id")?;
    let rank: i64 = row.try_get("rank")?;
    let tags: String = row.try_get("tags")?;
    let legend: Option<String> = row.try_get("legend")?;
    let sources: Option<String> = row.try_get("sources")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Artifact {
        id: ArtifactId::parse(&id).map_err(|e| StateStoreError::corrupt(e.to_string()))?,
        computation_id: parse_id(&computation_id)?,
        rank: u32::try_from(rank)
            .map_err(|_| StateStoreError::corrupt(format!("negative artifact rank {}", rank)))?,
        store_key: row.try_get("store_key")?,
        meta: ArtifactMeta {
            name: row.try_get("name")?,
            filename: row.try_get("filename")?,
            content_type: row.try_get("content_type")?,
            primary: row.try_get::<i64, _>("is_primary")? != 0,
            tags: serde_json::from_str::<BTreeSet<String>>(&tags)?,
            summary: row.try_get("summary")?,
            description: row.try_get("description")?,
            legend: legend.map(|raw| serde_json::from_str(&raw)).transpose()?,
            sources: sources.map(|raw| serde_json::from_str(&raw)).transpose()?,
        },
        created_at: CanopyDb::millis_to_datetime(created_at),
    })
}

pub(crate) fn parse_id(raw: &str) -> Result<CorrelationId> {
    CorrelationId::parse(raw).map_err(|e| StateStoreError::corrupt(e.to_string()))
}

pub(crate) fn parse_state(raw: &str) -> Result<ComputationState> {
    raw.parse::<ComputationState>()
        .map_err(StateStoreError::corrupt)
}
