//! Upload task types and lifecycle.

use crate::hash::{ContentHash, QuickSignature};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an upload task (the precheck ticket).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadTaskId(Uuid);

impl UploadTaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid precheck id: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadTaskId({})", self.0)
    }
}

impl fmt::Display for UploadTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload task status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Task created, no chunk received yet.
    Pending,
    /// At least one chunk received.
    Uploading,
    /// Finalized into a stored file.
    Completed,
    /// Finalize failed permanently.
    Failed,
    /// Client abandoned the task.
    Aborted,
}

impl UploadStatus {
    /// Parse from the stored string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(crate::Error::UnknownValue(format!("upload status: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Check if the task can still receive chunks or be finalized.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }

    /// Check if the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precheck input as received from a front-end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrecheckRequest {
    /// Display name chosen by the client.
    pub filename: String,
    /// Declared plaintext size in bytes.
    pub size: u64,
    /// Quick signature computed client-side (hex).
    pub chunk_signature: String,
    /// Hash of the first 4 MiB block (hex, empty when absent).
    #[serde(default)]
    pub first_chunk_hash: String,
    /// Hash of the second 4 MiB block.
    #[serde(default)]
    pub second_chunk_hash: String,
    /// Hash of the third 4 MiB block.
    #[serde(default)]
    pub third_chunk_hash: String,
    /// Target directory, `/` separated.
    #[serde(default = "default_virtual_path")]
    pub virtual_path: String,
    /// Client chunk size; the configured default applies when absent.
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

fn default_virtual_path() -> String {
    "/".to_string()
}

impl PrecheckRequest {
    /// Validate the sampled hashes and check that they derive the declared signature.
    pub fn quick_signature(&self) -> crate::Result<QuickSignature> {
        let derived = QuickSignature::from_stored(&[
            &self.first_chunk_hash,
            &self.second_chunk_hash,
            &self.third_chunk_hash,
        ])?;
        let declared = ContentHash::from_hex(&self.chunk_signature)?;
        if derived.signature != declared {
            return Err(crate::Error::HashMismatch {
                expected: declared.to_hex(),
                actual: derived.signature.to_hex(),
            });
        }
        Ok(derived)
    }
}

/// Result of a precheck.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrecheckOutcome {
    /// Content already stored; a new link was created.
    InstantUploaded { file_id: Uuid, user_file_id: Uuid },
    /// Client must upload chunks against this ticket.
    Ticket {
        precheck_id: UploadTaskId,
        sampled_hashes: Vec<String>,
        chunk_size: u64,
        total_chunks: u32,
        /// Indices already received when an existing task was resumed.
        received: Vec<u32>,
    },
}

/// Finalize options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FinalizeOptions {
    /// Encrypt the blob at rest.
    #[serde(default)]
    pub encrypt: bool,
    /// File passphrase; required when `encrypt` is set.
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Resumption view of an upload task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub precheck_id: UploadTaskId,
    pub status: UploadStatus,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub received: Vec<u32>,
    pub progress: f64,
}

impl UploadProgress {
    /// Indices not yet received.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| self.received.binary_search(i).is_err())
            .collect()
    }
}

/// Number of chunks a file of `size` bytes splits into. Empty files still send one chunk.
pub fn expected_chunk_count(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size).max(1)
}

/// Upload progress as a fraction in `[0, 1]`.
pub fn progress_fraction(uploaded: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        (f64::from(uploaded) / f64::from(total)).min(1.0)
    }
}

/// File name of a received chunk inside the task's temp directory.
pub fn chunk_file_name(index: u32) -> String {
    format!("{index}.chunk.data")
}
