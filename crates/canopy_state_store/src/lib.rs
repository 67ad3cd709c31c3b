//! Canopy state store: the single source of truth for computations.
//!
//! Provides semantic storage APIs over the SQLite database opened by
//! `canopy_db`: dedup resolution, the worker callback state machine,
//! artifact listing, the status event log, the plugin catalog and the
//! durable dispatch queue.

pub mod artifacts;
pub mod callbacks;
pub mod computations;
mod context;
mod error;
pub mod events;
pub mod models;
pub mod plugins;
pub mod queue;

use std::path::PathBuf;
use std::sync::Arc;

use canopy_db::CanopyDb;
use sqlx::sqlite::SqlitePool;

pub use artifacts::ArtifactStore;
pub use callbacks::CallbackHandler;
pub use computations::{ComputationStore, NewComputation};
pub use context::CanopyContext;
pub use error::{Result, StateStoreError};
pub use events::EventLog;
pub use models::{
    CancelOutcome, ComputationRecord, HeartbeatReply, NewArtifact, Resolution, TransitionOutcome,
};
pub use plugins::PluginCatalog;
pub use queue::{DeadLetter, DeadLetterReason, Delivery, SqlTransport, Transport};

/// Parsed state store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateStoreUrl {
    Sqlite(PathBuf),
}

impl StateStoreUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix("sqlite://")
            .or_else(|| raw.strip_prefix("sqlite:"));
        match rest.map(str::trim) {
            Some(path) if !path.is_empty() => Ok(Self::Sqlite(PathBuf::from(path))),
            Some(_) => Err(StateStoreError::UnsupportedUrl(format!(
                "sqlite URL missing path: {raw}"
            ))),
            None => Err(StateStoreError::UnsupportedUrl(raw.to_string())),
        }
    }
}

/// Semantic state store wrapper. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    db: CanopyDb,
    computations: ComputationStore,
    artifacts: ArtifactStore,
    callbacks: CallbackHandler,
    events: EventLog,
    plugins: PluginCatalog,
    transport: Arc<SqlTransport>,
}

impl StateStore {
    pub async fn open(raw: &str) -> Result<Self> {
        match StateStoreUrl::parse(raw)? {
            StateStoreUrl::Sqlite(path) => Ok(Self::from_db(CanopyDb::open(path).await?)),
        }
    }

    pub fn from_db(db: CanopyDb) -> Self {
        let pool = db.pool().clone();
        Self {
            computations: ComputationStore::new(pool.clone()),
            artifacts: ArtifactStore::new(pool.clone()),
            callbacks: CallbackHandler::new(pool.clone()),
            events: EventLog::new(pool.clone()),
            plugins: PluginCatalog::new(pool.clone()),
            transport: Arc::new(SqlTransport::new(pool)),
            db,
        }
    }

    pub fn computations(&self) -> &ComputationStore {
        &self.computations
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn callbacks(&self) -> &CallbackHandler {
        &self.callbacks
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn plugins(&self) -> &PluginCatalog {
        &self.plugins
    }

    /// Durable transport over the same database.
    pub fn transport(&self) -> Arc<SqlTransport> {
        Arc::clone(&self.transport)
    }

    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}
