//! `.info` sidecar written next to each blob for administrative recovery.

use crate::error::{StorageError, StorageResult};
use crate::layout::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sidecar contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// BLAKE3 of the plaintext.
    pub file_hash: String,
    /// BLAKE3 of the encrypted blob, when one exists.
    #[serde(default)]
    pub file_enc_hash: Option<String>,
}

impl BlobInfo {
    pub async fn write(&self, path: &Path) -> StorageResult<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| StorageError::Config(format!("failed to encode blob info: {e}")))?;
        write_atomic(path, &body).await
    }

    pub async fn read(path: &Path) -> StorageResult<Self> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::not_found_or_io(e, path.display()))?;
        serde_json::from_slice(&body).map_err(|e| {
            StorageError::InvalidPath(format!("malformed blob info {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sidecar_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.info");
        let info = BlobInfo {
            file_hash: "ab".repeat(32),
            file_enc_hash: None,
        };
        info.write(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"file_hash\""));
        assert_eq!(BlobInfo::read(&path).await.unwrap(), info);
    }

    #[tokio::test]
    async fn missing_sidecar_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BlobInfo::read(&dir.path().join("none.info")).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
