//! Disk registry repository.

use crate::error::MetadataResult;
use crate::models::DiskRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for storage disks.
#[async_trait]
pub trait DiskRepo: Send + Sync {
    /// Register a disk by root, returning the stored row (existing roots are kept).
    async fn register_disk(&self, disk: &DiskRow) -> MetadataResult<DiskRow>;

    /// All disks in insertion order.
    async fn list_disks(&self) -> MetadataResult<Vec<DiskRow>>;

    /// Get a disk by ID.
    async fn get_disk(&self, disk_id: Uuid) -> MetadataResult<Option<DiskRow>>;
}
