//! Recycle bin repository.

use crate::error::MetadataResult;
use crate::models::{PurgeOutcome, RecycledRow, UserFileRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for soft deletes, restores and permanent deletes.
#[async_trait]
pub trait RecycleRepo: Send + Sync {
    /// Soft-delete one live link and record it in the recycle bin.
    async fn soft_delete(
        &self,
        user_id: Uuid,
        user_file_id: Uuid,
        recycled_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<RecycledRow>;

    /// Soft-delete a directory subtree and every live link inside it.
    async fn soft_delete_directory(
        &self,
        user_id: Uuid,
        path_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<RecycledRow>>;

    /// Undo a soft delete. The link's directory chain is revived if needed.
    async fn restore(&self, user_id: Uuid, recycled_id: Uuid) -> MetadataResult<UserFileRow>;

    /// Get a recycle entry.
    async fn get_recycled(&self, recycled_id: Uuid) -> MetadataResult<Option<RecycledRow>>;

    /// A user's recycle bin, newest first.
    async fn list_recycled(&self, user_id: Uuid) -> MetadataResult<Vec<RecycledRow>>;

    /// Entries deleted before `cutoff`, oldest first.
    async fn list_recycled_before(&self, cutoff: OffsetDateTime)
    -> MetadataResult<Vec<RecycledRow>>;

    /// Permanently delete a recycle entry and its link, crediting the owner's quota.
    ///
    /// When no other reference remains the file and chunk rows go too and the
    /// artifacts to remove from disk are returned.
    async fn purge_recycled(&self, user_id: Uuid, recycled_id: Uuid)
    -> MetadataResult<PurgeOutcome>;
}
