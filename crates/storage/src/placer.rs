//! Disk selection for new blobs.

use crate::error::{StorageError, StorageResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// A registered storage disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskSpec {
    pub id: Uuid,
    pub root: PathBuf,
    /// Blob directory under `root`.
    pub data_dir: String,
    /// Configured capacity; larger disks are preferred.
    pub size: u64,
}

impl DiskSpec {
    /// `<root>/<data_dir>`.
    pub fn data_root(&self) -> PathBuf {
        self.root.join(&self.data_dir)
    }
}

/// Source of free-space figures.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn available_space(&self, path: &Path) -> StorageResult<u64>;
}

/// Probe backed by `statvfs`/`GetDiskFreeSpaceEx` through `fs4`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> StorageResult<u64> {
        // A disk root may not exist yet; measure its nearest existing ancestor.
        let mut probe = path;
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }
        Ok(fs4::available_space(probe)?)
    }
}

/// Picks the disk that receives a new blob.
#[derive(Clone)]
pub struct DiskPlacer {
    disks: Vec<DiskSpec>,
    probe: Arc<dyn SpaceProbe>,
}

impl DiskPlacer {
    /// Disks must be given in registration order.
    pub fn new(disks: Vec<DiskSpec>, probe: Arc<dyn SpaceProbe>) -> Self {
        Self { disks, probe }
    }

    pub fn disks(&self) -> &[DiskSpec] {
        &self.disks
    }

    pub fn get(&self, id: Uuid) -> Option<&DiskSpec> {
        self.disks.iter().find(|d| d.id == id)
    }

    /// The disk with the largest configured size that has `requested` free bytes.
    ///
    /// Ties go to the disk registered first. Disks whose free space cannot be
    /// read are skipped.
    pub fn select(&self, requested: u64) -> StorageResult<DiskSpec> {
        let mut best: Option<&DiskSpec> = None;
        for disk in &self.disks {
            let free = match self.probe.available_space(&disk.root) {
                Ok(free) => free,
                Err(e) => {
                    tracing::warn!(disk = %disk.root.display(), error = %e, "skipping disk with unreadable free space");
                    continue;
                }
            };
            if free < requested {
                continue;
            }
            if best.is_none_or(|b| disk.size > b.size) {
                best = Some(disk);
            }
        }

        best.cloned()
            .ok_or(StorageError::DiskFull { requested })
    }
}
