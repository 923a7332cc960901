//! Recycle bin: soft delete, restore and permanent delete.

use crate::disks::DiskSet;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use stowage_metadata::MetadataStore;
use stowage_metadata::models::{RecycledRow, ReleasedFile, UserFileRow, from_db_size};
use stowage_metadata::repos::{RecycleRepo, UserFileRepo};
use stowage_storage::remove_artifacts;
use time::OffsetDateTime;
use uuid::Uuid;

/// Result of one permanent delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// The last reference went away and the blob was removed from disk.
    pub physical_deleted: bool,
    /// Bytes credited back to the owner.
    pub refunded: u64,
}

/// Totals over a batch of permanent deletes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub purged: usize,
    pub physical_deleted: usize,
    pub refunded: u64,
    pub failed: usize,
}

impl PurgeSummary {
    fn add(&mut self, report: PurgeReport) {
        self.purged += 1;
        self.physical_deleted += usize::from(report.physical_deleted);
        self.refunded += report.refunded;
    }
}

pub struct RecycleService {
    metadata: Arc<dyn MetadataStore>,
    disks: Arc<DiskSet>,
}

impl RecycleService {
    pub fn new(metadata: Arc<dyn MetadataStore>, disks: Arc<DiskSet>) -> Self {
        Self { metadata, disks }
    }

    /// Soft-delete the caller's links to each of `file_ids`.
    ///
    /// Every id is checked before anything moves, so one foreign id fails the batch.
    #[tracing::instrument(skip(self, file_ids), fields(user_id = %user_id, count = file_ids.len()))]
    pub async fn move_to_recycle(&self, user_id: Uuid, file_ids: &[Uuid]) -> ApiResult<Vec<RecycledRow>> {
        let mut links = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let link = self
                .metadata
                .get_user_file(user_id, *file_id)
                .await?
                .ok_or_else(|| ApiError::NotOwned(format!("file {file_id}")))?;
            links.push(link);
        }

        let now = OffsetDateTime::now_utc();
        let mut recycled = Vec::with_capacity(links.len());
        for link in links {
            recycled.push(
                self.metadata
                    .soft_delete(user_id, link.user_file_id, Uuid::new_v4(), now)
                    .await?,
            );
        }
        tracing::info!(recycled = recycled.len(), "moved to recycle bin");
        Ok(recycled)
    }

    /// Soft-delete a directory and everything under it.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn move_directory_to_recycle(&self, user_id: Uuid, path_id: Uuid) -> ApiResult<Vec<RecycledRow>> {
        let recycled = self
            .metadata
            .soft_delete_directory(user_id, path_id, OffsetDateTime::now_utc())
            .await?;
        tracing::info!(recycled = recycled.len(), "directory moved to recycle bin");
        Ok(recycled)
    }

    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn restore(&self, user_id: Uuid, recycled_id: Uuid) -> ApiResult<UserFileRow> {
        let link = self.metadata.restore(user_id, recycled_id).await?;
        tracing::info!(user_file_id = %link.user_file_id, "restored from recycle bin");
        Ok(link)
    }

    pub async fn list(&self, user_id: Uuid) -> ApiResult<Vec<RecycledRow>> {
        Ok(self.metadata.list_recycled(user_id).await?)
    }

    /// Permanently delete one recycle entry.
    ///
    /// Disk artifacts are removed after the metadata commit. A removal failure
    /// is logged and counted; the metadata change stands.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn permanently_delete(&self, user_id: Uuid, recycled_id: Uuid) -> ApiResult<PurgeReport> {
        let outcome = self.metadata.purge_recycled(user_id, recycled_id).await?;
        let physical_deleted = match &outcome.released {
            Some(released) => {
                self.remove_released(released).await;
                true
            }
            None => false,
        };
        Ok(PurgeReport {
            physical_deleted,
            refunded: from_db_size(outcome.refunded)?,
        })
    }

    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn empty_recycle_bin(&self, user_id: Uuid) -> ApiResult<PurgeSummary> {
        let mut summary = PurgeSummary::default();
        for entry in self.metadata.list_recycled(user_id).await? {
            summary.add(self.permanently_delete(user_id, entry.recycled_id).await?);
        }
        tracing::info!(purged = summary.purged, "recycle bin emptied");
        Ok(summary)
    }

    /// Purge every entry recycled before `cutoff`, across users.
    pub async fn purge_expired(&self, cutoff: OffsetDateTime) -> ApiResult<PurgeSummary> {
        let mut summary = PurgeSummary::default();
        for entry in self.metadata.list_recycled_before(cutoff).await? {
            match self.permanently_delete(entry.user_id, entry.recycled_id).await {
                Ok(report) => summary.add(report),
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        recycled_id = %entry.recycled_id,
                        error = %e,
                        "failed to purge expired recycle entry"
                    );
                }
            }
        }
        if summary.purged > 0 || summary.failed > 0 {
            tracing::info!(
                purged = summary.purged,
                physical_deleted = summary.physical_deleted,
                failed = summary.failed,
                "expired recycle entries purged"
            );
        }
        Ok(summary)
    }

    async fn remove_released(&self, released: &ReleasedFile) {
        let file = &released.file;
        let mut relative: Vec<&str> = Vec::new();
        if !file.path.is_empty() {
            relative.push(&file.path);
        }
        relative.extend(file.enc_path.as_deref());
        relative.extend(file.thumbnail_path.as_deref());
        relative.extend(released.chunks.iter().map(|c| c.path.as_str()));

        let mut paths: Vec<PathBuf> = Vec::with_capacity(relative.len() + 1);
        for rel in relative {
            match self.disks.resolve(file.disk_id, rel).await {
                Ok(path) => paths.push(path),
                Err(e) => {
                    metrics::ARTIFACT_REMOVAL_FAILURES.inc();
                    tracing::warn!(file_id = %file.file_id, path = rel, error = %e, "unresolvable artifact path");
                }
            }
        }
        // The `.info` sidecar sits next to the first artifact.
        if let Some(dir) = paths.first().and_then(|p| p.parent()) {
            paths.push(dir.join(format!("{}.info", file.stored_name)));
        }

        let report = remove_artifacts(&paths).await;
        metrics::PERMANENT_DELETES.inc();
        metrics::BYTES_RECLAIMED.inc_by(u64::try_from(file.size).unwrap_or(0));
        if !report.is_clean() {
            metrics::ARTIFACT_REMOVAL_FAILURES.inc_by(report.failed.len() as u64);
        }
        tracing::debug!(
            file_id = %file.file_id,
            removed = report.removed,
            missing = report.missing,
            failed = report.failed.len(),
            "released blob removed"
        );
    }
}
