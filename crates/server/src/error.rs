//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stowage_metadata::MetadataError;
use stowage_storage::StorageError;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
///
/// Every variant maps to one stable `code` string; front-ends switch on it.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not owned: {0}")]
    NotOwned(String),

    #[error("chunk corrupt: {0}")]
    ChunkCorrupt(String),

    #[error("upload task expired")]
    TaskExpired,

    #[error("task cancelled")]
    TaskCancelled,

    #[error("deduplication candidate no longer matches")]
    DedupStale,

    #[error("message authentication failed")]
    MacMismatch,

    #[error("range not satisfiable: {0}")]
    RangeInvalid(String),

    #[error("no disk has room for {0} bytes")]
    DiskFull(u64),

    /// Detail is logged, never returned.
    #[error("metadata transaction failed")]
    TransactionFailed(String),

    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::NotOwned(_) => "not_owned",
            Self::ChunkCorrupt(_) => "chunk_corrupt",
            Self::TaskExpired => "task_expired",
            Self::TaskCancelled => "task_cancelled",
            Self::DedupStale => "dedup_stale",
            Self::MacMismatch => "mac_mismatch",
            Self::RangeInvalid(_) => "range_invalid",
            Self::DiskFull(_) => "disk_full",
            Self::TransactionFailed(_) => "transaction_failed",
            Self::SourceUnreachable(_) => "source_unreachable",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded(_) | Self::DiskFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::NotOwned(_) | Self::MacMismatch | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ChunkCorrupt(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TaskExpired => StatusCode::GONE,
            Self::TaskCancelled | Self::DedupStale | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RangeInvalid(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::SourceUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::TransactionFailed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransactionFailed(_) | Self::Internal(_) | Self::DiskFull(_)
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Self::TransactionFailed(detail) = &self {
            tracing::error!(detail = %detail, "metadata transaction failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<MetadataError> for ApiError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::QuotaExceeded { user_id, requested } => {
                Self::QuotaExceeded(format!("user {user_id} needs {requested} more bytes"))
            }
            MetadataError::NotFound(what) => Self::NotFound(what),
            MetadataError::AlreadyExists(what) => Self::Conflict(format!("already exists: {what}")),
            MetadataError::InvalidStateTransition { from, to } => {
                Self::Conflict(format!("invalid state transition: {from} -> {to}"))
            }
            MetadataError::Constraint(what) => Self::Conflict(what),
            MetadataError::Cycle(what) => Self::BadRequest(format!("cycle detected: {what}")),
            other @ (MetadataError::Database(_)
            | MetadataError::Config(_)
            | MetadataError::Internal(_)) => Self::TransactionFailed(other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::DiskFull { requested } => Self::DiskFull(requested),
            StorageError::InvalidRange(what) => Self::RangeInvalid(what),
            StorageError::AlreadyExists(what) => Self::Conflict(what),
            StorageError::Core(core) => core.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<stowage_core::Error> for ApiError {
    fn from(err: stowage_core::Error) -> Self {
        use stowage_core::Error as E;
        match err {
            E::MacMismatch => Self::MacMismatch,
            E::InvalidRange(what) => Self::RangeInvalid(what),
            err @ E::InvalidStateTransition { .. } => Self::Conflict(err.to_string()),
            E::Io(e) => Self::Internal(format!("I/O error: {e}")),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {err}"))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {err}"))
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
