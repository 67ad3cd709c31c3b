use canopy_db::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateStoreError>;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Unsupported state store URL: {0}")]
    UnsupportedUrl(String),

    #[error("Invalid artifact batch: {0}")]
    InvalidArtifacts(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StateStoreError {
    fn from(err: sqlx::Error) -> Self {
        StateStoreError::Db(DbError::from(err))
    }
}

impl From<serde_json::Error> for StateStoreError {
    fn from(err: serde_json::Error) -> Self {
        StateStoreError::Db(DbError::from(err))
    }
}

impl StateStoreError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StateStoreError::Corrupt(msg.into())
    }
}
