//! Local disk storage for stowage blobs.
//!
//! This crate provides:
//! - Disk selection by configured size and free space
//! - The on-disk blob layout with path-escape checks and atomic writes
//! - Chunk splitting for large blobs and merging of upload parts
//! - `.info` sidecars
//! - Range streams over single, chunked and encrypted blobs

pub mod chunks;
pub mod error;
pub mod info;
pub mod layout;
pub mod placer;
pub mod reader;

pub use chunks::{ChunkFile, merge_parts, split_into_chunks};
pub use error::{StorageError, StorageResult};
pub use info::BlobInfo;
pub use layout::{BlobLayout, BlobPaths, RemovalReport, install, remove_artifacts, remove_tree, write_atomic};
pub use placer::{DiskPlacer, DiskSpec, FsSpaceProbe, SpaceProbe};
pub use reader::{BlobSource, ByteStream, ChunkSpan};

use std::path::PathBuf;
use stowage_core::config::StorageConfig;
use uuid::Uuid;

/// Disk specs for the configured disks, before they are registered.
///
/// Ids are placeholders; the metadata registration assigns the durable ones.
pub fn configured_disks(config: &StorageConfig) -> StorageResult<Vec<DiskSpec>> {
    config.validate().map_err(StorageError::Config)?;
    Ok(config
        .disks
        .iter()
        .map(|d| DiskSpec {
            id: Uuid::new_v4(),
            root: d.path.clone(),
            data_dir: d.data_dir.clone(),
            size: d.size,
        })
        .collect())
}
