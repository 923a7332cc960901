//! Source-agnostic fetch interface.

use crate::error::ApiError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio_util::sync::CancellationToken;

/// What a source reports before any body bytes move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub file_name: String,
    pub size: Option<u64>,
    pub supports_range: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("cancelled")]
    Cancelled,

    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    Invalid(String),
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Io(_))
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => ApiError::TaskCancelled,
            FetchError::Unreachable(what) => ApiError::SourceUnreachable(what),
            FetchError::Io(e) => ApiError::Internal(format!("I/O error: {e}")),
            FetchError::Invalid(what) => ApiError::SourceUnreachable(what),
        }
    }
}

/// Pulls one remote resource into a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn probe(&self, url: &str) -> Result<Probe, FetchError>;

    /// Fetch into `dest`, continuing any partial file already there.
    ///
    /// `progress` holds the bytes on disk and is updated as data lands.
    /// Returns the final length.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        probe: &Probe,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Result<u64, FetchError>;
}
