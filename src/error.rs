use std::sync::Arc;
use thiserror::Error;

/// Failures reported by a document store backend.
///
/// Cloneable so a single transport failure can be pushed to every open
/// watch listener.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store connection closed")]
    Closed,

    #[error("database error: {0}")]
    Database(#[source] Arc<sqlx::Error>),

    #[error("serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(Arc::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(Arc::new(err))
    }
}

/// Every failure the synchronization layer surfaces to its consumers.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The live query could not be established.
    #[error("failed to set up notes subscription: {0}")]
    Setup(#[source] StoreError),

    /// The live query failed after it was open.
    #[error("notes subscription failed: {0}")]
    Transport(#[source] StoreError),

    #[error("failed to save note: {0}")]
    Write(#[source] StoreError),

    #[error("failed to delete note: {0}")]
    Delete(#[source] StoreError),

    #[error("malformed note document `{key}`: {source}")]
    MalformedPayload {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;
