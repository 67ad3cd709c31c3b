use canopy_protocol::ValidationError;
use canopy_state_store::StateStoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

impl SentinelError {
    /// Rejected before anything was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SentinelError::Validation(_) | SentinelError::UnknownPlugin(_)
        )
    }
}
