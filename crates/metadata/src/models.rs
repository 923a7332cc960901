//! Database models mapping to the metadata schema.
//!
//! Byte sizes are `i64` here because SQLite integers are signed; domain code
//! converts with [`to_db_size`] / [`from_db_size`].

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Convert a domain byte count into a database integer.
pub fn to_db_size(n: u64) -> MetadataResult<i64> {
    i64::try_from(n).map_err(|_| MetadataError::Constraint(format!("size {n} out of range")))
}

/// Convert a database integer into a domain byte count.
pub fn from_db_size(n: i64) -> MetadataResult<u64> {
    u64::try_from(n).map_err(|_| MetadataError::Internal(format!("negative size {n} in row")))
}

// =============================================================================
// Groups and permissions
// =============================================================================

/// User group. Exactly one group carries `is_default`.
#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    pub group_id: Uuid,
    pub name: String,
    pub is_default: bool,
    /// Quota assigned to users created in this group (0 = unlimited).
    pub default_space: i64,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Users
// =============================================================================

/// User record with quota accounting.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub username: String,
    pub group_id: Uuid,
    /// Total quota in bytes; 0 means unlimited.
    pub space: i64,
    /// Remaining quota; `0 <= free_space <= space` when `space > 0`.
    pub free_space: i64,
    /// bcrypt hash of the file-encryption passphrase.
    pub file_passphrase_hash: Option<String>,
    /// Hex salt for the per-user key derivation.
    pub file_salt: Option<String>,
    /// `normal` or `disabled`.
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserRow {
    /// Whether the user has a bounded quota.
    pub fn is_quota_bounded(&self) -> bool {
        self.space > 0
    }

    /// Whether `size` more bytes fit the quota.
    pub fn has_room_for(&self, size: i64) -> bool {
        !self.is_quota_bounded() || self.free_space >= size
    }
}

// =============================================================================
// Disks
// =============================================================================

/// Registered storage disk.
#[derive(Debug, Clone, FromRow)]
pub struct DiskRow {
    pub disk_id: Uuid,
    pub root: String,
    pub data_dir: String,
    pub size: i64,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Physical files
// =============================================================================

/// Physical file record, shared by every link that points at it.
#[derive(Debug, Clone, FromRow)]
pub struct FileInfoRow {
    pub file_id: Uuid,
    pub name: String,
    /// Randomized stored base name.
    pub stored_name: String,
    /// Authoritative on-disk byte length.
    pub size: i64,
    pub mime: String,
    pub disk_id: Uuid,
    /// Single blob path (empty when chunked or encrypted-only).
    pub path: String,
    pub thumbnail_path: Option<String>,
    pub full_hash: Option<String>,
    pub has_full_hash: bool,
    pub chunk_signature: String,
    pub first_chunk_hash: String,
    pub second_chunk_hash: String,
    pub third_chunk_hash: String,
    pub is_encrypted: bool,
    pub enc_path: Option<String>,
    pub is_chunked: bool,
    pub chunk_count: i64,
    pub created_at: OffsetDateTime,
}

impl FileInfoRow {
    /// The sampled hashes as stored, in order.
    pub fn sampled_hashes(&self) -> [&str; 3] {
        [
            &self.first_chunk_hash,
            &self.second_chunk_hash,
            &self.third_chunk_hash,
        ]
    }
}

/// One chunk file of a chunked blob.
#[derive(Debug, Clone, FromRow)]
pub struct FileChunkRow {
    pub file_id: Uuid,
    pub chunk_index: i64,
    pub path: String,
    pub size: i64,
    pub hash: String,
}

// =============================================================================
// Logical links and directories
// =============================================================================

/// A user's link to a physical file.
#[derive(Debug, Clone, FromRow)]
pub struct UserFileRow {
    pub user_file_id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub name: String,
    pub path_id: Uuid,
    pub is_public: bool,
    /// Rename copies may duplicate a live `(user_id, file_id)` pair.
    pub is_copy: bool,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Directory node in a user's virtual tree.
#[derive(Debug, Clone, FromRow)]
pub struct VirtualPathRow {
    pub path_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub is_dir: bool,
    /// `None` only for the user's root.
    pub parent_id: Option<Uuid>,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl VirtualPathRow {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

// =============================================================================
// Recycle bin
// =============================================================================

/// Recycle bin entry for one soft-deleted link.
#[derive(Debug, Clone, FromRow)]
pub struct RecycledRow {
    pub recycled_id: Uuid,
    pub user_id: Uuid,
    pub user_file_id: Uuid,
    pub file_id: Uuid,
    pub deleted_at: OffsetDateTime,
}

/// Physical artifacts released when the last reference to a file is purged.
#[derive(Debug, Clone)]
pub struct ReleasedFile {
    pub file: FileInfoRow,
    pub chunks: Vec<FileChunkRow>,
}

/// Result of a permanent delete.
#[derive(Debug, Clone)]
pub struct PurgeOutcome {
    /// Set when no reference remains and the blob must be removed from disk.
    pub released: Option<ReleasedFile>,
    /// Bytes credited back to the caller's quota (0 for unlimited users).
    pub refunded: i64,
}

// =============================================================================
// Commit outcomes
// =============================================================================

/// Outcome of the upload commit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new physical file and its link were inserted.
    Created,
    /// Another commit already stored this fingerprint; nothing was written.
    Duplicate(Uuid),
}

/// Outcome of linking an existing physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// New link inserted and quota debited.
    Linked(Uuid),
    /// The user already had a live link; nothing was written.
    AlreadyLinked(Uuid),
}

impl LinkOutcome {
    pub fn user_file_id(&self) -> Uuid {
        match self {
            Self::Linked(id) | Self::AlreadyLinked(id) => *id,
        }
    }
}

// =============================================================================
// Shares
// =============================================================================

/// Share link for one user file.
#[derive(Debug, Clone, FromRow)]
pub struct ShareRow {
    pub share_id: Uuid,
    pub user_id: Uuid,
    pub user_file_id: Uuid,
    pub file_id: Uuid,
    pub token: String,
    /// bcrypt hash; empty means no password.
    pub password_hash: String,
    pub expires_at: Option<OffsetDateTime>,
    pub download_count: i64,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Upload tasks
// =============================================================================

/// Resumable upload task.
#[derive(Debug, Clone, FromRow)]
pub struct UploadTaskRow {
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub uploaded_chunks: i64,
    pub chunk_signature: String,
    pub first_chunk_hash: String,
    pub second_chunk_hash: String,
    pub third_chunk_hash: String,
    pub virtual_path: String,
    pub disk_id: Uuid,
    pub temp_dir: String,
    pub status: String,
    pub error: Option<String>,
    pub expire_time: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UploadTaskRow {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expire_time
    }
}

// =============================================================================
// Offline download tasks
// =============================================================================

/// Offline download task.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadTaskRow {
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub source: String,
    pub virtual_path: String,
    pub encrypt: bool,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub downloaded_bytes: i64,
    pub progress: f64,
    /// Rolling speed in bytes per second.
    pub speed: i64,
    pub state: String,
    pub supports_range: bool,
    /// Partial download location on disk.
    pub local_path: Option<String>,
    pub file_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Progress snapshot written by the download progress task.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgressUpdate {
    pub downloaded_bytes: i64,
    pub progress: f64,
    pub speed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_conversions_are_checked() {
        assert_eq!(to_db_size(5).unwrap(), 5);
        assert!(to_db_size(u64::MAX).is_err());
        assert_eq!(from_db_size(7).unwrap(), 7);
        assert!(from_db_size(-1).is_err());
    }
}
