use canopy_state_store::StateStoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Worker runtime errors. Plugin failures are [`crate::PluginError`] values,
/// not this type.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error("Object store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Artifact stage error: {0}")]
    Stage(String),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
