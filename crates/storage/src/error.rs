//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("no disk has {requested} free bytes")]
    DiskFull { requested: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] stowage_core::Error),
}

impl StorageError {
    pub(crate) fn not_found_or_io(err: std::io::Error, what: impl std::fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(what.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
