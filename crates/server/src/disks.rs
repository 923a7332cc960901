//! The registered disks with one blob layout each.

use crate::error::{ApiError, ApiResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_storage::{BlobLayout, DiskPlacer, DiskSpec, SpaceProbe, StorageResult};
use uuid::Uuid;

/// Placer plus per-disk layouts.
pub struct DiskSet {
    placer: DiskPlacer,
    layouts: HashMap<Uuid, BlobLayout>,
}

impl DiskSet {
    /// Disks must come in registration order.
    pub fn new(
        disks: Vec<DiskSpec>,
        probe: Arc<dyn SpaceProbe>,
        temp_dir: &str,
    ) -> StorageResult<Self> {
        let mut layouts = HashMap::with_capacity(disks.len());
        for disk in &disks {
            layouts.insert(disk.id, BlobLayout::new(disk, temp_dir)?);
        }
        Ok(Self {
            placer: DiskPlacer::new(disks, probe),
            layouts,
        })
    }

    pub fn disks(&self) -> &[DiskSpec] {
        self.placer.disks()
    }

    /// Layout of a registered disk.
    pub fn layout(&self, disk_id: Uuid) -> ApiResult<&BlobLayout> {
        self.layouts
            .get(&disk_id)
            .ok_or_else(|| ApiError::Internal(format!("disk {disk_id} is not registered")))
    }

    /// Pick the disk for `requested` bytes.
    pub fn select(&self, requested: u64) -> ApiResult<(Uuid, &BlobLayout)> {
        let disk = self.placer.select(requested)?;
        Ok((disk.id, self.layout(disk.id)?))
    }

    /// Resolve a path stored relative to a disk root.
    pub async fn resolve(&self, disk_id: Uuid, relative: &str) -> ApiResult<PathBuf> {
        Ok(self.layout(disk_id)?.resolve(relative).await?)
    }
}

/// Store `path` relative to the disk `root`, `/`-separated.
pub fn relative_to(root: &Path, path: &Path) -> ApiResult<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ApiError::Internal(format!(
            "{} is outside disk {}",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
