//! Tar packages of several files, built in the background.

use crate::disks::DiskSet;
use crate::error::{ApiError, ApiResult};
use crate::reader::FileReader;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use stowage_core::filename::unique_name;
use stowage_metadata::MetadataStore;
use stowage_metadata::repos::{FileRepo, UserFileRepo};
use stowage_storage::{BlobSource, remove_tree};
use time::OffsetDateTime;
use uuid::Uuid;

const ARCHIVE_NAME: &str = "package.tar";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Building,
    Ready,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct PackageProgress {
    pub state: PackageState,
    pub total: usize,
    pub done: usize,
    /// Encrypted files left out of the archive.
    pub skipped: Vec<Uuid>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

pub struct PackageTask {
    pub id: Uuid,
    pub user_id: Uuid,
    dir: PathBuf,
    progress: Mutex<PackageProgress>,
}

impl PackageTask {
    fn lock(&self) -> MutexGuard<'_, PackageProgress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn progress(&self) -> PackageProgress {
        self.lock().clone()
    }

    fn archive(&self) -> PathBuf {
        self.dir.join(ARCHIVE_NAME)
    }
}

/// A finished archive handed to the caller, who removes `dir` when done.
#[derive(Debug)]
pub struct PackageArchive {
    pub path: PathBuf,
    pub dir: PathBuf,
}

struct Entry {
    name: String,
    source: BlobSource,
}

pub struct PackageRegistry {
    tasks: DashMap<Uuid, Arc<PackageTask>>,
    metadata: Arc<dyn MetadataStore>,
    disks: Arc<DiskSet>,
    reader: Arc<FileReader>,
}

impl PackageRegistry {
    pub fn new(metadata: Arc<dyn MetadataStore>, disks: Arc<DiskSet>, reader: Arc<FileReader>) -> Self {
        Self {
            tasks: DashMap::new(),
            metadata,
            disks,
            reader,
        }
    }

    /// Start packaging `file_ids`, all owned by `user_id`.
    #[tracing::instrument(skip(self, file_ids), fields(user_id = %user_id, count = file_ids.len()))]
    pub async fn start(&self, user_id: Uuid, file_ids: &[Uuid]) -> ApiResult<Uuid> {
        if file_ids.is_empty() {
            return Err(ApiError::BadRequest("nothing to package".to_string()));
        }

        let mut entries = Vec::with_capacity(file_ids.len());
        let mut skipped = Vec::new();
        let mut names = HashSet::new();
        let mut estimate = 0u64;
        for file_id in file_ids {
            let link = self
                .metadata
                .get_user_file(user_id, *file_id)
                .await?
                .ok_or_else(|| ApiError::NotOwned(format!("file {file_id}")))?;
            let file = self
                .metadata
                .get_file(*file_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("file {file_id}")))?;
            if file.is_encrypted {
                skipped.push(*file_id);
                continue;
            }
            let name = unique_name(&link.name, |candidate| names.contains(candidate));
            names.insert(name.clone());
            estimate += u64::try_from(file.size).unwrap_or(0);
            entries.push(Entry {
                name,
                source: self.reader.plain_source(&file).await?,
            });
        }

        let id = Uuid::new_v4();
        let (_, layout) = self.disks.select(estimate)?;
        let dir = layout.temp_area("package", &id.simple().to_string())?;
        let task = Arc::new(PackageTask {
            id,
            user_id,
            dir,
            progress: Mutex::new(PackageProgress {
                state: PackageState::Building,
                total: entries.len(),
                done: 0,
                skipped,
                error: None,
                finished_at: None,
            }),
        });
        self.tasks.insert(id, task.clone());

        tokio::spawn(async move {
            let worker = task.clone();
            let built = tokio::task::spawn_blocking(move || build_archive(&worker, entries)).await;
            let error = match built {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("package worker failed: {e}")),
            };
            if let Some(error) = &error {
                tracing::warn!(package_id = %task.id, error = %error, "package build failed");
                if let Err(e) = remove_tree(&task.dir).await {
                    tracing::warn!(package_id = %task.id, error = %e, "failed to remove package scratch");
                }
            } else {
                tracing::info!(package_id = %task.id, "package ready");
            }
            let mut progress = task.lock();
            progress.state = if error.is_some() {
                PackageState::Failed
            } else {
                PackageState::Ready
            };
            progress.error = error;
            progress.finished_at = Some(OffsetDateTime::now_utc());
        });

        Ok(id)
    }

    pub fn progress(&self, user_id: Uuid, id: Uuid) -> ApiResult<PackageProgress> {
        Ok(self.owned(user_id, id)?.progress())
    }

    /// Hand over a ready archive and forget the task.
    pub fn take(&self, user_id: Uuid, id: Uuid) -> ApiResult<PackageArchive> {
        let task = self.owned(user_id, id)?;
        match task.progress().state {
            PackageState::Ready => {}
            PackageState::Building => {
                return Err(ApiError::Conflict("package is still building".to_string()));
            }
            PackageState::Failed => {
                return Err(ApiError::Conflict("package build failed".to_string()));
            }
        }
        self.tasks.remove(&id);
        Ok(PackageArchive {
            path: task.archive(),
            dir: task.dir.clone(),
        })
    }

    /// Drop finished packages that finished before `cutoff`.
    pub async fn sweep(&self, cutoff: OffsetDateTime) -> usize {
        let stale: Vec<Arc<PackageTask>> = self
            .tasks
            .iter()
            .filter(|task| {
                task.lock()
                    .finished_at
                    .is_some_and(|finished| finished < cutoff)
            })
            .map(|task| task.value().clone())
            .collect();
        for task in &stale {
            self.tasks.remove(&task.id);
            if let Err(e) = remove_tree(&task.dir).await {
                tracing::warn!(package_id = %task.id, error = %e, "failed to remove stale package");
            }
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn owned(&self, user_id: Uuid, id: Uuid) -> ApiResult<Arc<PackageTask>> {
        self.tasks
            .get(&id)
            .map(|task| task.value().clone())
            .filter(|task| task.user_id == user_id)
            .ok_or_else(|| ApiError::NotFound(format!("package {id}")))
    }
}

fn build_archive(task: &PackageTask, entries: Vec<Entry>) -> std::io::Result<()> {
    std::fs::create_dir_all(&task.dir)?;
    let out = std::fs::File::create(task.archive())?;
    let mut builder = tar::Builder::new(std::io::BufWriter::new(out));
    let mtime = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;

    for entry in entries {
        let (size, reader) = open_plain(&entry.source)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder.append_data(&mut header, &entry.name, reader)?;
        task.lock().done += 1;
    }

    builder.into_inner()?.into_inner().map_err(|e| e.into_error())?.sync_all()
}

/// Total size and a reader over a plaintext source.
fn open_plain(source: &BlobSource) -> std::io::Result<(u64, Box<dyn Read>)> {
    match source {
        BlobSource::Single { path } => {
            let file = std::fs::File::open(path)?;
            Ok((file.metadata()?.len(), Box::new(file)))
        }
        BlobSource::Chunked { chunks } => {
            let mut size = 0;
            let mut reader: Box<dyn Read> = Box::new(std::io::empty());
            for chunk in chunks {
                size += chunk.size;
                reader = Box::new(reader.chain(open_exact(&chunk.path, chunk.size)?));
            }
            Ok((size, reader))
        }
        BlobSource::Encrypted { .. } => Err(std::io::Error::other(
            "encrypted blobs are not packaged",
        )),
    }
}

fn open_exact(path: &Path, size: u64) -> std::io::Result<std::io::Take<std::fs::File>> {
    Ok(std::fs::File::open(path)?.take(size))
}
