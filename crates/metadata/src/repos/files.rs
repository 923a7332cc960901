//! Physical file repository.

use crate::error::MetadataResult;
use crate::models::{CommitOutcome, FileChunkRow, FileInfoRow, LinkOutcome, UserFileRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for physical file records and the upload commit.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Dedup probe: the unencrypted file stored under `(chunk_signature, size)`.
    async fn find_by_fingerprint(
        &self,
        chunk_signature: &str,
        size: i64,
    ) -> MetadataResult<Option<FileInfoRow>>;

    /// Get a file by ID.
    async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileInfoRow>>;

    /// Chunk records of a file in ascending index order.
    async fn get_chunks(&self, file_id: Uuid) -> MetadataResult<Vec<FileChunkRow>>;

    /// Insert a file, its chunks and the uploader's link, and debit quota, in one transaction.
    ///
    /// When `task_id` is given the upload task is marked completed in the same
    /// transaction. If the fingerprint is already stored nothing is written and
    /// `Duplicate` names the existing file.
    async fn commit_upload(
        &self,
        file: &FileInfoRow,
        chunks: &[FileChunkRow],
        link: &UserFileRow,
        task_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> MetadataResult<CommitOutcome>;

    /// Instant upload: link an existing file and debit its size, in one transaction.
    async fn link_existing(
        &self,
        link: &UserFileRow,
        task_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> MetadataResult<LinkOutcome>;

    /// Live links plus recycle rows pointing at a file.
    async fn count_references(&self, file_id: Uuid) -> MetadataResult<u64>;
}
