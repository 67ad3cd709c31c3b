//! Computation rows and the atomic dedup check-and-insert.

use canopy_db::CanopyDb;
use canopy_protocol::{
    Aoi, ComputationState, CorrelationId, Fingerprint, RequestId, RequestRecord, ShelfLife,
    StateView,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Result, StateStoreError};
use crate::events::record_event;
use crate::models::{parse_id, ComputationRecord, Resolution};

/// Everything needed to create a computation on a dedup miss.
#[derive(Debug, Clone)]
pub struct NewComputation<'a> {
    pub plugin_id: &'a str,
    pub plugin_version: &'a str,
    pub fingerprint: &'a Fingerprint,
    pub params: &'a Value,
    pub aoi: &'a Aoi,
    pub shelf_life: ShelfLife,
}

#[derive(Clone)]
pub struct ComputationStore {
    pool: SqlitePool,
}

impl ComputationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the live computation matching (`plugin_id`, `fingerprint`) or
    /// create a QUEUED one. Either way a request row is recorded.
    ///
    /// The whole operation is one write transaction. The unique index over
    /// (`plugin_id`, `fingerprint`, `live_slot`) means a concurrent creator
    /// that commits first wins; the loser folds into the winner's id.
    #[tracing::instrument(
        name = "db.resolve_or_create",
        level = "debug",
        skip_all,
        fields(plugin_id = new.plugin_id)
    )]
    pub async fn resolve_or_create(&self, new: NewComputation<'_>, now: i64) -> Result<Resolution> {
        let mut tx = self.pool.begin().await?;

        // Write first: the transaction holds the write lock from here on.
        let released = release_slots_for(&mut tx, new.plugin_id, new.fingerprint, now).await?;
        if released > 0 {
            debug!(
                plugin_id = new.plugin_id,
                fingerprint = %new.fingerprint,
                released,
                "Released stale dedup slots"
            );
        }

        let cacheable = new.shelf_life.is_cacheable();
        let existing = if cacheable {
            select_live(&mut tx, new.plugin_id, new.fingerprint, now).await?
        } else {
            None
        };

        let (correlation_id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = CorrelationId::new();
                let inserted = insert_computation(&mut tx, &id, &new, cacheable, now).await?;
                if inserted {
                    record_event(&mut tx, &id, ComputationState::Queued, None, now).await?;
                    (id, true)
                } else {
                    let winner = select_live(&mut tx, new.plugin_id, new.fingerprint, now)
                        .await?
                        .ok_or_else(|| {
                            StateStoreError::corrupt(format!(
                                "dedup slot for {} held by no live computation",
                                new.fingerprint
                            ))
                        })?;
                    (winner, false)
                }
            }
        };

        let request_id = RequestId::new();
        sqlx::query(
            r#"
            INSERT INTO computation_requests (request_id, computation_id, requested_at, aoi_name, aoi_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(request_id.as_str())
        .bind(correlation_id.as_str())
        .bind(now)
        .bind(new.aoi.name.as_deref())
        .bind(new.aoi.id.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if created {
            info!(
                correlation_id = %correlation_id,
                plugin_id = new.plugin_id,
                "Created computation"
            );
        } else {
            info!(
                correlation_id = %correlation_id,
                plugin_id = new.plugin_id,
                "Request folded into live computation"
            );
        }

        Ok(Resolution {
            correlation_id,
            request_id,
            created,
        })
    }

    pub async fn get(&self, id: &CorrelationId) -> Result<Option<ComputationRecord>> {
        let row = sqlx::query("SELECT * FROM computations WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ComputationRecord::from_row).transpose()
    }

    pub async fn get_state(&self, id: &CorrelationId) -> Result<Option<StateView>> {
        Ok(self.get(id).await?.map(|record| record.state_view()))
    }

    /// Map a request back to the computation serving it.
    pub async fn resolve_request(&self, request_id: &RequestId) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(
            r#"
            SELECT request_id, computation_id, requested_at, aoi_name, aoi_id
            FROM computation_requests
            WHERE request_id = ?
            "#,
        )
        .bind(request_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let computation_id: String = row.try_get("computation_id")?;
        Ok(Some(RequestRecord {
            request_id: request_id.clone(),
            correlation_id: parse_id(&computation_id)?,
            requested_at: CanopyDb::millis_to_datetime(row.try_get("requested_at")?),
            aoi_name: row.try_get("aoi_name")?,
            aoi_id: row.try_get("aoi_id")?,
        }))
    }

    /// Number of requests served by a computation (1 + folded duplicates).
    pub async fn request_count(&self, id: &CorrelationId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM computation_requests WHERE computation_id = ?")
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Release the dedup slot of every computation whose shelf life has lapsed.
    ///
    /// Rows are kept; they only stop matching new requests.
    pub async fn release_expired_slots(&self, now: i64) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE computations SET live_slot = NULL WHERE live_slot IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(released)
    }

    pub async fn count_by_state(&self, state: ComputationState) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM computations WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

async fn release_slots_for(
    conn: &mut SqliteConnection,
    plugin_id: &str,
    fingerprint: &Fingerprint,
    now: i64,
) -> Result<u64> {
    let released = sqlx::query(
        r#"
        UPDATE computations SET live_slot = NULL
        WHERE plugin_id = ? AND fingerprint = ? AND live_slot IS NOT NULL
          AND (expires_at <= ? OR state IN ('FAILURE', 'EXPIRED'))
        "#,
    )
    .bind(plugin_id)
    .bind(fingerprint.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(released)
}

async fn select_live(
    conn: &mut SqliteConnection,
    plugin_id: &str,
    fingerprint: &Fingerprint,
    now: i64,
) -> Result<Option<CorrelationId>> {
    let id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM computations
        WHERE plugin_id = ? AND fingerprint = ? AND live_slot = 1
          AND state IN ('QUEUED', 'STARTED', 'SUCCESS')
          AND expires_at > ?
        LIMIT 1
        "#,
    )
    .bind(plugin_id)
    .bind(fingerprint.as_str())
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    id.as_deref().map(parse_id).transpose()
}

/// Returns false when the dedup slot was taken by a concurrent insert.
async fn insert_computation(
    conn: &mut SqliteConnection,
    id: &CorrelationId,
    new: &NewComputation<'_>,
    cacheable: bool,
    now: i64,
) -> Result<bool> {
    let live_slot: Option<i64> = cacheable.then_some(1);
    let inserted = sqlx::query(
        r#"
        INSERT INTO computations (
            id, plugin_id, plugin_version, fingerprint, state, live_slot,
            params, aoi, aoi_name, aoi_id, request_ts, expires_at
        )
        VALUES (?, ?, ?, ?, 'QUEUED', ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (plugin_id, fingerprint, live_slot) DO NOTHING
        "#,
    )
    .bind(id.as_str())
    .bind(new.plugin_id)
    .bind(new.plugin_version)
    .bind(new.fingerprint.as_str())
    .bind(live_slot)
    .bind(serde_json::to_string(new.params)?)
    .bind(serde_json::to_string(new.aoi)?)
    .bind(new.aoi.name.as_deref())
    .bind(new.aoi.id.as_deref())
    .bind(now)
    .bind(new.shelf_life.expires_at(now))
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted == 1)
}
