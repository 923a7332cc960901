//! The upload pipeline: precheck, chunk intake and finalize.
//!
//! - **Precheck** answers from the quick signature: link existing content
//!   (instant upload), resume a live task, or issue a new ticket.
//! - **Chunk intake** verifies each part's MD5 and records it idempotently.
//! - **Finalize** merges, re-checks the signature, hashes, places, optionally
//!   encrypts or chunks, and commits in one metadata transaction.

pub mod inspect;
pub mod pipeline;

pub use inspect::{ContentSniffer, ImageThumbnailer, InferSniffer, Thumbnailer};
pub use pipeline::{StoredFile, UploadPipeline};

use crate::error::{ApiError, ApiResult};

/// Canonical `/a/b` form of a client directory path.
pub fn normalize_virtual_path(raw: &str) -> ApiResult<String> {
    let mut segments = Vec::new();
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains('\\') {
            return Err(ApiError::BadRequest(format!(
                "invalid path segment {segment:?}"
            )));
        }
        segments.push(segment);
    }
    Ok(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_paths_are_canonical() {
        assert_eq!(normalize_virtual_path("").unwrap(), "/");
        assert_eq!(normalize_virtual_path("/").unwrap(), "/");
        assert_eq!(normalize_virtual_path("docs//2024/").unwrap(), "/docs/2024");
        assert!(normalize_virtual_path("/a/../b").is_err());
        assert!(normalize_virtual_path("a\\b").is_err());
    }
}
