//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("quota exceeded for user {user_id}: need {requested} bytes")]
    QuotaExceeded { user_id: String, requested: u64 },

    #[error("cycle detected: {0}")]
    Cycle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether a database error is a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            Self::AlreadyExists(_) => true,
            _ => false,
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
