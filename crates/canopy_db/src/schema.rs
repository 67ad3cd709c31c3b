//! Database schema creation for all Canopy tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//! Timestamps are Unix milliseconds.

use crate::error::{DbError, Result};
use crate::CanopyDb;
use tracing::info;

pub const SCHEMA_VERSION: i64 = 1;

impl CanopyDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_catalog_tables().await?;
        self.create_computation_tables().await?;
        self.create_queue_tables().await?;
        self.record_schema_version().await?;

        info!(version = SCHEMA_VERSION, "Database schema verified");
        Ok(())
    }

    async fn record_schema_version(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
            Some(version) if version != SCHEMA_VERSION => {
                return Err(DbError::constraint(format!(
                    "Schema version {} found, expected {}",
                    version, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Plugins known to the sentinel.
    async fn create_catalog_tables(&self) -> Result<()> {
        // shelf_life_ms: NULL = forever, 0 = never
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS plugins (
                plugin_id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                shelf_life_ms INTEGER,
                description TEXT NOT NULL DEFAULT '',
                registered_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Computations, their artifacts, request lookups and the event log.
    async fn create_computation_tables(&self) -> Result<()> {
        // live_slot is 1 while the row may match dedup lookups and NULL once it
        // can no longer. NULLs are distinct in a UNIQUE index, so at most one
        // row per (plugin_id, fingerprint) holds the slot.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS computations (
                id TEXT PRIMARY KEY,
                plugin_id TEXT NOT NULL,
                plugin_version TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                state TEXT NOT NULL,
                live_slot INTEGER,
                params TEXT NOT NULL,
                validated_params TEXT,
                aoi TEXT NOT NULL,
                aoi_name TEXT,
                aoi_id TEXT,
                request_ts INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                started_at INTEGER,
                completion_ts INTEGER,
                worker_name TEXT,
                last_heartbeat INTEGER,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                error_message TEXT,
                artifact_warnings TEXT NOT NULL DEFAULT '{}'
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_computations_live \
             ON computations(plugin_id, fingerprint, live_slot)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_computations_state ON computations(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS computation_requests (
                request_id TEXT PRIMARY KEY,
                computation_id TEXT NOT NULL REFERENCES computations(id) ON DELETE CASCADE,
                requested_at INTEGER NOT NULL,
                aoi_name TEXT,
                aoi_id TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_computation \
             ON computation_requests(computation_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                computation_id TEXT NOT NULL REFERENCES computations(id) ON DELETE CASCADE,
                rank INTEGER NOT NULL,
                name TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                store_key TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                summary TEXT NOT NULL DEFAULT '',
                description TEXT,
                legend TEXT,
                sources TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(computation_id, rank)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS computation_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                computation_id TEXT NOT NULL REFERENCES computations(id) ON DELETE CASCADE,
                state TEXT NOT NULL,
                error_message TEXT,
                recorded_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_computation \
             ON computation_events(computation_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Durable dispatch queue and its dead-letter table.
    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dispatch_queue (
                message_id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                enqueued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                claimed_by TEXT,
                claimed_at INTEGER,
                delivery_count INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dispatch_queue_pending \
             ON dispatch_queue(queue_name, status, enqueued_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dispatch_queue_correlation \
             ON dispatch_queue(correlation_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                dead_lettered_at INTEGER NOT NULL,
                processed_at INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_unprocessed \
             ON dead_letters(processed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
