//! Offline download task repository.

use crate::error::MetadataResult;
use crate::models::{DownloadProgressUpdate, DownloadTaskRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for offline download tasks.
#[async_trait]
pub trait DownloadTaskRepo: Send + Sync {
    /// Create a task.
    async fn create_download_task(&self, task: &DownloadTaskRow) -> MetadataResult<()>;

    /// Get a task by ID.
    async fn get_download_task(&self, task_id: Uuid) -> MetadataResult<Option<DownloadTaskRow>>;

    /// A user's tasks, newest first.
    async fn list_download_tasks(&self, user_id: Uuid) -> MetadataResult<Vec<DownloadTaskRow>>;

    /// Compare-and-set the state. Returns false when the row was not in `from`.
    async fn transition_download(
        &self,
        task_id: Uuid,
        from: &str,
        to: &str,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Record probe results.
    async fn set_download_probe(
        &self,
        task_id: Uuid,
        file_name: &str,
        file_size: Option<i64>,
        supports_range: bool,
        local_path: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Write a progress snapshot.
    async fn update_download_progress(
        &self,
        task_id: Uuid,
        update: DownloadProgressUpdate,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Record the ingested file and move `downloading` to `finished`.
    ///
    /// A task paused after its bytes arrived finishes too, since the file is already stored.
    async fn finish_download(
        &self,
        task_id: Uuid,
        file_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete a task row.
    async fn delete_download_task(&self, task_id: Uuid) -> MetadataResult<()>;

    /// Startup recovery: move every `downloading` task to `paused`.
    async fn pause_interrupted_downloads(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}
