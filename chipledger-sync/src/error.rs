//! Error types for the sync layer.

use chipledger_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to the remote store or applying its data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection, DNS, or server-side failure. Worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The remote did not answer in time. Treated like a network failure.
    #[error("operation timed out")]
    Timeout,

    /// Credentials missing, expired, or rejected.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The remote refused a write the user is not allowed to make.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The targeted session does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A session mutation was rejected by the model.
    #[error(transparent)]
    Model(#[from] chipledger_types::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Returns true for failures that a later attempt may not hit.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// Returns true when the user has to sign in again.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}
