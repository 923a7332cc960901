//! Upload task repository.

use crate::error::MetadataResult;
use crate::models::UploadTaskRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for resumable upload tasks.
#[async_trait]
pub trait UploadTaskRepo: Send + Sync {
    /// Create a task.
    async fn create_upload_task(&self, task: &UploadTaskRow) -> MetadataResult<()>;

    /// Get a task by ID.
    async fn get_upload_task(&self, task_id: Uuid) -> MetadataResult<Option<UploadTaskRow>>;

    /// A live, unexpired task of the same user for the same content and target.
    async fn find_resumable_task(
        &self,
        user_id: Uuid,
        chunk_signature: &str,
        size: i64,
        virtual_path: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<UploadTaskRow>>;

    /// Record a received chunk index. Idempotent; returns the new received count.
    ///
    /// Moves the task from `pending` to `uploading`.
    async fn record_chunk(&self, task_id: Uuid, index: u32, now: OffsetDateTime)
    -> MetadataResult<u32>;

    /// Received chunk indices in ascending order.
    async fn received_chunks(&self, task_id: Uuid) -> MetadataResult<Vec<u32>>;

    /// Set the task status and optional error message.
    async fn update_upload_status(
        &self,
        task_id: Uuid,
        status: &str,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Extend the expiry of an active task.
    async fn renew_upload_task(
        &self,
        task_id: Uuid,
        expire_time: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Tasks to clean up: expired active ones plus failed or aborted ones.
    async fn list_stale_upload_tasks(&self, now: OffsetDateTime)
    -> MetadataResult<Vec<UploadTaskRow>>;

    /// Delete a task and its chunk records.
    async fn delete_upload_task(&self, task_id: Uuid) -> MetadataResult<()>;
}
