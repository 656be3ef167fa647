//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by key/value backends.
///
/// These never escape [`crate::LocalStore::save`] or [`crate::LocalStore::load`];
/// the store logs them and falls back to its backups.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The write would exceed the backend's capacity.
    #[error("quota exceeded: {needed} bytes needed, {capacity} available")]
    QuotaExceeded { needed: usize, capacity: usize },

    /// Stored data exists but cannot be interpreted.
    #[error("corrupted data under key {key}: {reason}")]
    Corrupted { key: String, reason: String },

    /// Write rejected by the backend.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// A session record whose shape cannot be salvaged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("session record is not an object")]
    NotAnObject,

    #[error("session record has no id")]
    MissingId,

    #[error("session id is not a valid UUID: {0}")]
    InvalidId(String),
}
