//! Worker callback handler: applies lifecycle transitions.
//!
//! Every transition is a conditional `UPDATE ... WHERE state = <expected>`
//! whose `rows_affected` decides the outcome. A second delivery of the same
//! callback, or a callback for a terminal computation, matches no row and is
//! reported as [`TransitionOutcome::Ignored`]. The event row and any artifact
//! rows are written in the same transaction as the state flip.

use std::collections::BTreeMap;
use std::time::Duration;

use canopy_protocol::{
    defaults, ArtifactId, ComputationFailure, ComputationState, CorrelationId, ErrorKind,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{Result, StateStoreError};
use crate::events::record_event;
use crate::models::{parse_id, parse_state, CancelOutcome, HeartbeatReply, NewArtifact, TransitionOutcome};
use crate::queue::SqlTransport;

#[derive(Clone)]
pub struct CallbackHandler {
    pool: SqlitePool,
}

impl CallbackHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// QUEUED -> STARTED.
    #[tracing::instrument(
        name = "db.claim",
        level = "debug",
        skip_all,
        fields(correlation_id = %id)
    )]
    pub async fn claim(
        &self,
        id: &CorrelationId,
        worker_name: &str,
        now: i64,
    ) -> Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            r#"
            UPDATE computations
            SET state = 'STARTED',
                started_at = ?,
                last_heartbeat = ?,
                worker_name = ?
            WHERE id = ? AND state = 'QUEUED'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(worker_name)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            tx.rollback().await?;
            debug!(correlation_id = %id, worker_name, "Claim ignored: computation not QUEUED");
            return Ok(TransitionOutcome::Ignored);
        }

        record_event(&mut tx, id, ComputationState::Started, None, now).await?;
        tx.commit().await?;

        info!(correlation_id = %id, worker_name, "Computation started");
        Ok(TransitionOutcome::Applied)
    }

    /// Record a liveness signal and report pending cancellation.
    pub async fn heartbeat(&self, id: &CorrelationId, now: i64) -> Result<HeartbeatReply> {
        let cancel_requested: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE computations SET last_heartbeat = ?
            WHERE id = ? AND state = 'STARTED'
            RETURNING cancel_requested
            "#,
        )
        .bind(now)
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match cancel_requested {
            Some(flag) => HeartbeatReply {
                alive: true,
                cancel_requested: flag != 0,
            },
            None => HeartbeatReply {
                alive: false,
                cancel_requested: false,
            },
        })
    }

    /// Store the params the plugin accepted, only while STARTED.
    pub async fn record_validated_params(
        &self,
        id: &CorrelationId,
        params: &Value,
    ) -> Result<TransitionOutcome> {
        let rows_affected = sqlx::query(
            "UPDATE computations SET validated_params = ? WHERE id = ? AND state = 'STARTED'",
        )
        .bind(serde_json::to_string(params)?)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(if rows_affected == 0 {
            TransitionOutcome::Ignored
        } else {
            TransitionOutcome::Applied
        })
    }

    /// Issue an artifact identity, only while the computation is STARTED.
    pub async fn allocate_artifact(&self, id: &CorrelationId) -> Result<Option<ArtifactId>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM computations WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match state.as_deref().map(parse_state).transpose()? {
            Some(ComputationState::Started) => Ok(Some(ArtifactId::new())),
            _ => Ok(None),
        }
    }

    /// STARTED -> SUCCESS together with the artifact rows.
    ///
    /// An empty batch never succeeds: the computation fails instead, listing
    /// the artifact warnings when there are any.
    #[tracing::instrument(
        name = "db.commit_success",
        level = "debug",
        skip_all,
        fields(correlation_id = %id, artifacts = artifacts.len())
    )]
    pub async fn commit_success(
        &self,
        id: &CorrelationId,
        artifacts: &[NewArtifact],
        warnings: &BTreeMap<String, String>,
        now: i64,
    ) -> Result<TransitionOutcome> {
        if artifacts.is_empty() {
            warn!(correlation_id = %id, "Computation produced no artifacts");
            let failure = ComputationFailure::no_artifacts(warnings);
            return self.report_failure(id, &failure, warnings, now).await;
        }
        if let Some(pair) = artifacts.windows(2).find(|pair| pair[0].rank >= pair[1].rank) {
            return Err(StateStoreError::InvalidArtifacts(format!(
                "ranks must strictly increase in creation order ({} then {})",
                pair[0].rank, pair[1].rank
            )));
        }

        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            r#"
            UPDATE computations
            SET state = 'SUCCESS',
                completion_ts = ?,
                artifact_warnings = ?
            WHERE id = ? AND state = 'STARTED'
            "#,
        )
        .bind(now)
        .bind(serde_json::to_string(warnings)?)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            tx.rollback().await?;
            debug!(correlation_id = %id, "Success ignored: computation not STARTED");
            return Ok(TransitionOutcome::Ignored);
        }

        for artifact in artifacts {
            insert_artifact(&mut tx, id, artifact, now).await?;
        }
        record_event(&mut tx, id, ComputationState::Success, None, now).await?;
        tx.commit().await?;

        info!(
            correlation_id = %id,
            artifacts = artifacts.len(),
            warnings = warnings.len(),
            "Computation succeeded"
        );
        Ok(TransitionOutcome::Applied)
    }

    /// STARTED -> FAILURE as reported by a worker.
    #[tracing::instrument(
        name = "db.report_failure",
        level = "debug",
        skip_all,
        fields(correlation_id = %id, kind = %failure.kind)
    )]
    pub async fn report_failure(
        &self,
        id: &CorrelationId,
        failure: &ComputationFailure,
        warnings: &BTreeMap<String, String>,
        now: i64,
    ) -> Result<TransitionOutcome> {
        let failure = match failure.kind {
            ErrorKind::User | ErrorKind::Cancelled => failure.clone(),
            // Detail stays in worker logs.
            ErrorKind::Internal => ComputationFailure::internal(),
            ErrorKind::Timeout | ErrorKind::Expired => {
                return Err(StateStoreError::InvalidTransition(format!(
                    "{} failures are decided by the reaper, not reported",
                    failure.kind
                )))
            }
        };

        let mut tx = self.pool.begin().await?;
        let applied = fail_in_tx(
            &mut tx,
            id,
            ComputationState::Started,
            &failure,
            Some(warnings),
            now,
        )
        .await?;
        if !applied {
            tx.rollback().await?;
            debug!(correlation_id = %id, "Failure ignored: computation not STARTED");
            return Ok(TransitionOutcome::Ignored);
        }
        tx.commit().await?;

        info!(correlation_id = %id, kind = %failure.kind, "Computation failed");
        Ok(TransitionOutcome::Applied)
    }

    /// Cancel a computation.
    ///
    /// QUEUED computations are revoked outright. STARTED ones are only
    /// flagged; the worker may or may not honor the flag.
    #[tracing::instrument(
        name = "db.cancel",
        level = "debug",
        skip_all,
        fields(correlation_id = %id)
    )]
    pub async fn cancel(&self, id: &CorrelationId, now: i64) -> Result<CancelOutcome> {
        let mut tx = self.pool.begin().await?;

        let revoked = fail_in_tx(
            &mut tx,
            id,
            ComputationState::Queued,
            &ComputationFailure::cancelled(),
            None,
            now,
        )
        .await?;
        if revoked {
            let messages = SqlTransport::revoke(&mut tx, id).await?;
            tx.commit().await?;
            info!(correlation_id = %id, messages, "Revoked queued computation");
            return Ok(CancelOutcome::Revoked);
        }

        let flagged = sqlx::query(
            "UPDATE computations SET cancel_requested = 1 WHERE id = ? AND state = 'STARTED'",
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if flagged > 0 {
            tx.commit().await?;
            info!(correlation_id = %id, "Cancellation requested for running computation");
            return Ok(CancelOutcome::Requested);
        }

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM computations WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        tx.rollback().await?;

        match state.as_deref().map(parse_state).transpose()? {
            Some(state) => Ok(CancelOutcome::AlreadyTerminal(state)),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// QUEUED -> FAILURE for a computation whose dispatch could not be published.
    pub async fn abandon_undispatched(&self, id: &CorrelationId, now: i64) -> Result<TransitionOutcome> {
        let failure = ComputationFailure {
            kind: ErrorKind::Internal,
            message: defaults::DISPATCH_FAILED_MESSAGE.to_string(),
        };
        let mut tx = self.pool.begin().await?;
        let applied = fail_in_tx(&mut tx, id, ComputationState::Queued, &failure, None, now).await?;
        tx.commit().await?;
        Ok(if applied {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Ignored
        })
    }

    /// QUEUED -> EXPIRED for every unprocessed dead letter.
    ///
    /// Dead letters are marked processed in the same transaction; a letter
    /// whose computation already moved on is simply consumed.
    pub async fn expire_dead_lettered(&self, now: i64) -> Result<Vec<CorrelationId>> {
        let mut tx = self.pool.begin().await?;

        let letters: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE dead_letters SET processed_at = ?
            WHERE processed_at IS NULL
            RETURNING correlation_id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let failure = ComputationFailure::expired();
        let mut expired = Vec::new();
        for raw in letters {
            let id = parse_id(&raw)?;
            if fail_in_tx(&mut tx, &id, ComputationState::Queued, &failure, None, now).await? {
                expired.push(id);
            }
        }
        tx.commit().await?;

        for id in &expired {
            warn!(correlation_id = %id, "Computation expired: dispatch message dead-lettered");
        }
        Ok(expired)
    }

    /// QUEUED -> EXPIRED for computations older than `max_age` that have
    /// neither a queued message nor an unprocessed dead letter.
    pub async fn expire_orphaned(&self, max_age: Duration, now: i64) -> Result<Vec<CorrelationId>> {
        let cutoff = now.saturating_sub(i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX));
        let failure = ComputationFailure::expired();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE computations
            SET state = 'EXPIRED', error_kind = ?, error_message = ?, completion_ts = ?, live_slot = NULL
            WHERE state = 'QUEUED' AND request_ts <= ?
              AND NOT EXISTS (SELECT 1 FROM dispatch_queue q WHERE q.correlation_id = computations.id)
              AND NOT EXISTS (
                  SELECT 1 FROM dead_letters d
                  WHERE d.correlation_id = computations.id AND d.processed_at IS NULL
              )
            RETURNING id
            "#,
        )
        .bind(failure.kind.as_str())
        .bind(failure.row_message())
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = parse_id(&raw)?;
            record_event(&mut tx, &id, ComputationState::Expired, Some(&failure.message), now).await?;
            expired.push(id);
        }
        tx.commit().await?;

        for id in &expired {
            warn!(correlation_id = %id, "Computation expired: no dispatch message on record");
        }
        Ok(expired)
    }

    /// STARTED -> FAILURE (timeout) for computations silent for longer than `grace`.
    pub async fn timeout_stale(&self, grace: Duration, now: i64) -> Result<Vec<CorrelationId>> {
        let cutoff = now.saturating_sub(i64::try_from(grace.as_millis()).unwrap_or(i64::MAX));
        let failure = ComputationFailure::timeout(grace);
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE computations
            SET state = 'FAILURE', error_kind = ?, error_message = ?, completion_ts = ?, live_slot = NULL
            WHERE state = 'STARTED' AND COALESCE(last_heartbeat, started_at, request_ts) < ?
            RETURNING id
            "#,
        )
        .bind(failure.kind.as_str())
        .bind(&failure.message)
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut timed_out = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = parse_id(&raw)?;
            record_event(&mut tx, &id, ComputationState::Failure, Some(&failure.message), now).await?;
            timed_out.push(id);
        }
        tx.commit().await?;

        for id in &timed_out {
            warn!(correlation_id = %id, grace_secs = grace.as_secs(), "Computation timed out");
        }
        Ok(timed_out)
    }
}

/// Conditionally move `id` from `from` into the failure's terminal state,
/// releasing its dedup slot. Returns whether a row changed.
async fn fail_in_tx(
    conn: &mut SqliteConnection,
    id: &CorrelationId,
    from: ComputationState,
    failure: &ComputationFailure,
    warnings: Option<&BTreeMap<String, String>>,
    now: i64,
) -> Result<bool> {
    let to = failure.state();
    if !from.can_transition(to) {
        return Ok(false);
    }
    let warnings = warnings.map(serde_json::to_string).transpose()?;

    let rows_affected = sqlx::query(
        r#"
        UPDATE computations
        SET state = ?,
            error_kind = ?,
            error_message = ?,
            completion_ts = ?,
            live_slot = NULL,
            artifact_warnings = COALESCE(?, artifact_warnings)
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(to.as_str())
    .bind(failure.kind.as_str())
    .bind(failure.row_message())
    .bind(now)
    .bind(warnings)
    .bind(id.as_str())
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Ok(false);
    }
    record_event(conn, id, to, Some(&failure.message), now).await?;
    Ok(true)
}

async fn insert_artifact(
    conn: &mut SqliteConnection,
    computation_id: &CorrelationId,
    artifact: &NewArtifact,
    now: i64,
) -> Result<()> {
    let meta = &artifact.meta;
    sqlx::query(
        r#"
        INSERT INTO artifacts (
            id, computation_id, rank, name, filename, content_type, store_key,
            is_primary, tags, summary, description, legend, sources, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(artifact.id.as_str())
    .bind(computation_id.as_str())
    .bind(i64::from(artifact.rank))
    .bind(&meta.name)
    .bind(&meta.filename)
    .bind(&meta.content_type)
    .bind(&artifact.store_key)
    .bind(meta.primary)
    .bind(serde_json::to_string(&meta.tags)?)
    .bind(&meta.summary)
    .bind(meta.description.as_deref())
    .bind(meta.legend.as_ref().map(serde_json::to_string).transpose()?)
    .bind(meta.sources.as_ref().map(serde_json::to_string).transpose()?)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
