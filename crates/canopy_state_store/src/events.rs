//! Append-only log of computation state changes.
//!
//! Every transition writes its event inside the transaction that applies it,
//! so the log never disagrees with the computation rows.

use canopy_db::CanopyDb;
use canopy_protocol::{ComputationState, CorrelationId, StatusEvent};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;

use crate::error::Result;
use crate::models::{parse_id, parse_state};

pub(crate) async fn record_event(
    conn: &mut SqliteConnection,
    id: &CorrelationId,
    state: ComputationState,
    error_message: Option<&str>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO computation_events (computation_id, state, error_message, recorded_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(id.as_str())
    .bind(state.as_str())
    .bind(error_message)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Events for `id` with `seq > after_seq`, oldest first.
    pub async fn events_after(&self, id: &CorrelationId, after_seq: i64) -> Result<Vec<StatusEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, computation_id, state, error_message, recorded_at
            FROM computation_events
            WHERE computation_id = ? AND seq > ?
            ORDER BY seq ASC
            "#,
        )
        .bind(id.as_str())
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StatusEvent> {
                let computation_id: String = row.try_get("computation_id")?;
                let state: String = row.try_get("state")?;
                Ok(StatusEvent {
                    seq: row.try_get("seq")?,
                    correlation_id: parse_id(&computation_id)?,
                    state: parse_state(&state)?,
                    error_message: row.try_get("error_message")?,
                    recorded_at: CanopyDb::millis_to_datetime(row.try_get("recorded_at")?),
                })
            })
            .collect()
    }

    pub async fn history(&self, id: &CorrelationId) -> Result<Vec<StatusEvent>> {
        self.events_after(id, 0).await
    }
}
