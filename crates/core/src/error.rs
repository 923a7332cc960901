//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("message authentication failed")]
    MacMismatch,

    #[error("malformed encrypted blob: {0}")]
    MalformedBlob(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("invalid download source: {0}")]
    InvalidSource(String),

    #[error("invalid state transition: {from} -> {action}")]
    InvalidStateTransition { from: String, action: String },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown value: {0}")]
    UnknownValue(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error should surface as `MacMismatch` to callers.
    pub fn is_mac_mismatch(&self) -> bool {
        matches!(self, Self::MacMismatch)
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
