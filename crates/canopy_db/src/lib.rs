//! SQLite database layer for Canopy.
//!
//! Owns the connection pool and the schema. Domain operations live in
//! `canopy_state_store`, which borrows the pool from here.
//!
//! # Usage
//!
//! ```rust,ignore
//! use canopy_db::CanopyDb;
//!
//! let db = CanopyDb::open("/var/lib/canopy/canopy.sqlite").await?;
//! let pool = db.pool().clone();
//! ```

mod error;
mod schema;

pub use error::{DbError, Result};
pub use schema::SCHEMA_VERSION;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const MAX_CONNECTIONS: u32 = 5;
/// Writers wait this long for the SQLite write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle on the Canopy state database.
#[derive(Clone)]
pub struct CanopyDb {
    pool: SqlitePool,
}

impl CanopyDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = Self::connect_options(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an existing database (fails if not exists).
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DbError::not_found(format!(
                "Database not found: {}",
                path.display()
            )));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(Self::connect_options(path))
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    fn connect_options(path: &Path) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl CanopyDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime, clamping values chrono cannot represent.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
    }
}
