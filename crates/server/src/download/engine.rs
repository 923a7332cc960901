//! Offline download engine: task lifecycle, worker spawning and ingest.

use super::fetcher::{Fetcher, Probe};
use super::progress::SpeedTracker;
use super::supervisor::DownloadSupervisor;
use super::torrent::TorrentClient;
use crate::disks::DiskSet;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::permissions;
use crate::upload::{StoredFile, UploadPipeline, normalize_virtual_path};
use crate::users::UserService;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stowage_core::download::DownloadControl;
use stowage_core::{DownloadAction, DownloadSource, DownloadState, Permission, UserSecret, filename};
use stowage_metadata::MetadataStore;
use stowage_metadata::models::{DownloadProgressUpdate, DownloadTaskRow, from_db_size, to_db_size};
use stowage_metadata::repos::{DownloadTaskRepo, UserFileRepo, VirtualPathRepo};
use stowage_storage::remove_tree;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How often the progress task writes a snapshot.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts per torrent file ingest.
const INGEST_ATTEMPTS: u32 = 3;

pub struct DownloadEngine {
    metadata: Arc<dyn MetadataStore>,
    disks: Arc<DiskSet>,
    uploads: Arc<UploadPipeline>,
    users: Arc<UserService>,
    supervisor: Arc<DownloadSupervisor>,
    http: Arc<dyn Fetcher>,
    torrents: Arc<dyn TorrentClient>,
    /// User secrets of encrypted tasks, held until the task finishes.
    secrets: Mutex<HashMap<Uuid, UserSecret>>,
    ingest_backoff: Duration,
}

impl DownloadEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        disks: Arc<DiskSet>,
        uploads: Arc<UploadPipeline>,
        users: Arc<UserService>,
        http: Arc<dyn Fetcher>,
        torrents: Arc<dyn TorrentClient>,
    ) -> Self {
        Self {
            metadata,
            disks,
            uploads,
            users,
            supervisor: Arc::new(DownloadSupervisor::new()),
            http,
            torrents,
            secrets: Mutex::new(HashMap::new()),
            ingest_backoff: Duration::from_secs(1),
        }
    }

    /// Shorten the torrent ingest backoff. Tests only.
    pub fn with_ingest_backoff(mut self, backoff: Duration) -> Self {
        self.ingest_backoff = backoff;
        self
    }

    pub fn supervisor(&self) -> &Arc<DownloadSupervisor> {
        &self.supervisor
    }

    /// Create a task for `source` and start it.
    #[tracing::instrument(skip(self, passphrase), fields(user_id = %user_id))]
    pub async fn submit(
        self: &Arc<Self>,
        user_id: Uuid,
        source: &str,
        virtual_path: &str,
        encrypt: bool,
        passphrase: Option<&str>,
    ) -> ApiResult<DownloadTaskRow> {
        permissions::require(self.metadata.as_ref(), user_id, Permission::OfflineDownload).await?;
        let parsed = DownloadSource::parse(source)?;
        let virtual_path = normalize_virtual_path(virtual_path)?;
        let secret = if encrypt {
            let passphrase = passphrase.ok_or_else(|| {
                ApiError::BadRequest("a passphrase is required to encrypt".to_string())
            })?;
            Some(self.users.unlock(user_id, passphrase).await?)
        } else {
            None
        };

        let now = OffsetDateTime::now_utc();
        let row = DownloadTaskRow {
            task_id: Uuid::new_v4(),
            user_id,
            kind: parsed.kind().as_str().to_string(),
            source: parsed.as_str().to_string(),
            virtual_path,
            encrypt,
            file_name: None,
            file_size: None,
            downloaded_bytes: 0,
            progress: 0.0,
            speed: 0,
            state: DownloadState::Init.as_str().to_string(),
            supports_range: false,
            local_path: None,
            file_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.metadata.create_download_task(&row).await?;
        if let Some(secret) = secret {
            self.secrets_guard().insert(row.task_id, secret);
        }
        tracing::info!(task_id = %row.task_id, kind = %row.kind, "download submitted");
        self.spawn_task(row.task_id);
        Ok(row)
    }

    pub async fn get(&self, user_id: Uuid, task_id: Uuid) -> ApiResult<DownloadTaskRow> {
        self.owned(user_id, task_id).await
    }

    pub async fn list(&self, user_id: Uuid) -> ApiResult<Vec<DownloadTaskRow>> {
        Ok(self.metadata.list_download_tasks(user_id).await?)
    }

    /// Pause, resume, cancel or delete a task.
    ///
    /// Resuming an encrypted task after a restart needs the passphrase again.
    #[tracing::instrument(skip(self, passphrase), fields(user_id = %user_id, task_id = %task_id))]
    pub async fn control(
        self: &Arc<Self>,
        user_id: Uuid,
        task_id: Uuid,
        control: DownloadControl,
        passphrase: Option<&str>,
    ) -> ApiResult<DownloadTaskRow> {
        let row = self.owned(user_id, task_id).await?;
        let state = DownloadState::parse(&row.state)?;
        let Some(action) = control.action() else {
            return self.delete(row, state).await;
        };
        let next = state.transition(action)?;
        let now = OffsetDateTime::now_utc();

        if action == DownloadAction::Resume && row.encrypt && !self.has_secret(task_id) {
            let passphrase = passphrase.ok_or_else(|| {
                ApiError::BadRequest("the passphrase is needed to resume this task".to_string())
            })?;
            let secret = self.users.unlock(user_id, passphrase).await?;
            self.secrets_guard().insert(task_id, secret);
        }

        let error = (action == DownloadAction::Cancel).then_some("cancelled by user");
        let moved = self
            .metadata
            .transition_download(task_id, state.as_str(), next.as_str(), error, now)
            .await?;
        if !moved {
            return Err(ApiError::Conflict(
                "download state changed concurrently".to_string(),
            ));
        }

        match action {
            DownloadAction::Pause => {
                self.supervisor.cancel(task_id);
            }
            DownloadAction::Cancel => {
                self.supervisor.cancel(task_id);
                self.secrets_guard().remove(&task_id);
            }
            DownloadAction::Resume => self.spawn_task(task_id),
            _ => {}
        }
        tracing::info!(from = %state, to = %next, "download state changed");
        self.owned(user_id, task_id).await
    }

    async fn delete(&self, row: DownloadTaskRow, state: DownloadState) -> ApiResult<DownloadTaskRow> {
        if !state.is_deletable() {
            return Err(ApiError::Conflict(format!(
                "a {state} download cannot be deleted"
            )));
        }
        self.supervisor.cancel(row.task_id);
        if let Some(scratch) = &row.local_path {
            remove_tree(Path::new(scratch)).await?;
        }
        self.metadata.delete_download_task(row.task_id).await?;
        self.secrets_guard().remove(&row.task_id);
        tracing::info!(task_id = %row.task_id, "download deleted");
        Ok(row)
    }

    /// Run a task's worker graph in the background.
    fn spawn_task(self: &Arc<Self>, task_id: Uuid) {
        let registration = self.supervisor.register(task_id);
        let engine = self.clone();
        tokio::spawn(async move {
            metrics::DOWNLOADS_ACTIVE.inc();
            let result = engine.run(task_id, registration.token.clone()).await;
            metrics::DOWNLOADS_ACTIVE.dec();
            match result {
                Ok(()) => {}
                Err(ApiError::TaskCancelled) => {
                    tracing::debug!(task_id = %task_id, "download stopped");
                }
                Err(e) => engine.fail(task_id, &e).await,
            }
            engine.supervisor.deregister(task_id, registration.generation);
        });
    }

    async fn run(&self, task_id: Uuid, cancel: CancellationToken) -> ApiResult<()> {
        let row = self
            .metadata
            .get_download_task(task_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("download {task_id}")))?;
        match DownloadState::parse(&row.state)? {
            DownloadState::Init | DownloadState::Downloading => {}
            other => {
                tracing::debug!(state = %other, "nothing to run");
                return Ok(());
            }
        }
        match DownloadSource::parse(&row.source)? {
            DownloadSource::Http { url } => self.run_http(row, &url, cancel).await,
            DownloadSource::Torrent { magnet_or_path } => {
                self.run_torrent(row, &magnet_or_path, cancel).await
            }
        }
    }

    #[tracing::instrument(skip_all, fields(task_id = %row.task_id))]
    async fn run_http(&self, row: DownloadTaskRow, url: &str, cancel: CancellationToken) -> ApiResult<()> {
        let row = if row.state == DownloadState::Init.as_str() {
            let probe = tokio::select! {
                _ = cancel.cancelled() => return Err(ApiError::TaskCancelled),
                probe = self.http.probe(url) => probe?,
            };
            self.start(&row, &probe.file_name, probe.size, probe.supports_range)
                .await?
        } else {
            row
        };

        let probe = Probe {
            file_name: row
                .file_name
                .clone()
                .ok_or_else(|| ApiError::Internal("download task was never probed".to_string()))?,
            size: row.file_size.map(from_db_size).transpose()?,
            supports_range: row.supports_range,
        };
        let scratch = scratch_dir(&row)?;
        let dest = scratch.join(&probe.file_name);

        let counter = Arc::new(AtomicU64::new(from_db_size(row.downloaded_bytes)?));
        let fetched = self
            .with_progress(row.task_id, counter.clone(), probe.size, async {
                self.http
                    .fetch(url, &dest, &probe, cancel.clone(), counter.clone())
                    .await
            })
            .await;
        let len = fetched?;
        if cancel.is_cancelled() {
            return Err(ApiError::TaskCancelled);
        }
        tracing::info!(bytes = len, "download complete, ingesting");

        let secret = self.secret_for(&row)?;
        let stored = self
            .uploads
            .ingest_local_file(row.user_id, &dest, &probe.file_name, &row.virtual_path, secret)
            .await?;
        self.complete(&row, Some(stored.file_id), &scratch).await
    }

    #[tracing::instrument(skip_all, fields(task_id = %row.task_id))]
    async fn run_torrent(
        &self,
        row: DownloadTaskRow,
        source: &str,
        cancel: CancellationToken,
    ) -> ApiResult<()> {
        let row = if row.state == DownloadState::Init.as_str() {
            let ts = OffsetDateTime::now_utc().unix_timestamp();
            let name = filename::choose(None, source, ts).unwrap_or_else(|_| filename::default_name(ts));
            self.start(&row, &name, None, false).await?
        } else {
            row
        };
        let scratch = scratch_dir(&row)?;

        let counter = Arc::new(AtomicU64::new(0));
        let files = self
            .with_progress(row.task_id, counter.clone(), None, async {
                self.torrents
                    .fetch(source, &scratch, cancel.clone(), counter.clone())
                    .await
            })
            .await?;
        if cancel.is_cancelled() {
            return Err(ApiError::TaskCancelled);
        }
        if files.is_empty() {
            return Err(ApiError::SourceUnreachable("torrent contained no files".to_string()));
        }

        let secret = self.secret_for(&row)?;
        // Names already taken, per virtual directory the torrent writes into.
        let mut taken: HashMap<String, HashSet<String>> = HashMap::new();

        let mut first = None;
        let mut failures = Vec::new();
        for path in &files {
            let relative = path.strip_prefix(&scratch).unwrap_or(path.as_path());
            let (dir_path, raw) = match torrent_placement(&row.virtual_path, relative) {
                Ok(placement) => placement,
                Err(e) => {
                    failures.push(format!("{}: {e}", relative.display()));
                    continue;
                }
            };
            let names = match taken.entry(dir_path.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let dir = self.metadata.ensure_path(row.user_id, &dir_path).await?;
                    let existing = self.metadata.names_in_path(row.user_id, dir.path_id).await?;
                    entry.insert(existing.into_iter().collect())
                }
            };
            let name = filename::unique_name(&raw, |n| names.contains(n));
            names.insert(name.clone());
            match self
                .ingest_with_retry(row.user_id, path, &name, &dir_path, secret.clone(), &cancel)
                .await
            {
                Ok(stored) => {
                    first.get_or_insert(stored.file_id);
                }
                Err(ApiError::TaskCancelled) => return Err(ApiError::TaskCancelled),
                Err(e) => failures.push(format!("{name}: {e}")),
            }
        }

        if !failures.is_empty() {
            tracing::warn!(failed = failures.len(), total = files.len(), "some torrent files were not stored");
        }
        match first {
            Some(file_id) => self.complete(&row, Some(file_id), &scratch).await,
            None => Err(ApiError::SourceUnreachable(failures.join("; "))),
        }
    }

    /// Record probe results, create the scratch area and move `init` to `downloading`.
    async fn start(
        &self,
        row: &DownloadTaskRow,
        file_name: &str,
        size: Option<u64>,
        supports_range: bool,
    ) -> ApiResult<DownloadTaskRow> {
        let (_, layout) = self.disks.select(size.unwrap_or(0))?;
        let scratch = layout.temp_area("download", &row.task_id.simple().to_string())?;
        tokio::fs::create_dir_all(&scratch).await?;

        let now = OffsetDateTime::now_utc();
        self.metadata
            .set_download_probe(
                row.task_id,
                file_name,
                size.map(to_db_size).transpose()?,
                supports_range,
                &scratch.to_string_lossy(),
                now,
            )
            .await?;
        let moved = self
            .metadata
            .transition_download(
                row.task_id,
                DownloadState::Init.as_str(),
                DownloadState::Downloading.as_str(),
                None,
                now,
            )
            .await?;
        if !moved {
            // Cancelled while probing.
            return Err(ApiError::TaskCancelled);
        }
        self.metadata
            .get_download_task(row.task_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("download {}", row.task_id)))
    }

    async fn complete(&self, row: &DownloadTaskRow, file_id: Option<Uuid>, scratch: &Path) -> ApiResult<()> {
        let finished = self
            .metadata
            .finish_download(row.task_id, file_id, OffsetDateTime::now_utc())
            .await?;
        if !finished {
            tracing::warn!("task was cancelled or deleted before it could be finished");
        }
        if let Err(e) = remove_tree(scratch).await {
            tracing::warn!(error = %e, "failed to remove download scratch area");
        }
        self.secrets_guard().remove(&row.task_id);
        tracing::info!(file_id = ?file_id, "download finished");
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &ApiError) {
        tracing::warn!(task_id = %task_id, error = %error, "download failed");
        let message = error.to_string();
        let now = OffsetDateTime::now_utc();
        for from in [DownloadState::Downloading, DownloadState::Init] {
            match self
                .metadata
                .transition_download(task_id, from.as_str(), DownloadState::Failed.as_str(), Some(&message), now)
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "failed to record download failure");
                    break;
                }
            }
        }
        self.secrets_guard().remove(&task_id);
    }

    async fn ingest_with_retry(
        &self,
        user_id: Uuid,
        path: &Path,
        name: &str,
        virtual_path: &str,
        secret: Option<UserSecret>,
        cancel: &CancellationToken,
    ) -> ApiResult<StoredFile> {
        let mut attempt = 0;
        loop {
            match self
                .uploads
                .ingest_local_file(user_id, path, name, virtual_path, secret.clone())
                .await
            {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_transient() && attempt + 1 < INGEST_ATTEMPTS => {
                    let delay = self.ingest_backoff * (1 << attempt);
                    tracing::debug!(name, attempt, error = %e, "ingest failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ApiError::TaskCancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive `work` while a side task writes progress snapshots about once a second.
    async fn with_progress<F, T>(
        &self,
        task_id: Uuid,
        counter: Arc<AtomicU64>,
        total: Option<u64>,
        work: F,
    ) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let stop = CancellationToken::new();
        let reporter = self.spawn_reporter(task_id, counter.clone(), total, stop.clone());
        let output = work.await;
        stop.cancel();
        let _ = reporter.await;
        output
    }

    fn spawn_reporter(
        &self,
        task_id: Uuid,
        counter: Arc<AtomicU64>,
        total: Option<u64>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let metadata = self.metadata.clone();
        tokio::spawn(async move {
            let mut tracker = SpeedTracker::new(counter.load(Ordering::Relaxed));
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            loop {
                let stopping = tokio::select! {
                    _ = stop.cancelled() => true,
                    _ = ticker.tick() => false,
                };
                let bytes = counter.load(Ordering::Relaxed);
                let speed = if stopping { 0 } else { tracker.observe(bytes) };
                let update = DownloadProgressUpdate {
                    downloaded_bytes: i64::try_from(bytes).unwrap_or(i64::MAX),
                    progress: progress_of(bytes, total),
                    speed: i64::try_from(speed).unwrap_or(i64::MAX),
                };
                if let Err(e) = metadata
                    .update_download_progress(task_id, update, OffsetDateTime::now_utc())
                    .await
                {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to write download progress");
                }
                if stopping {
                    break;
                }
            }
        })
    }

    fn secret_for(&self, row: &DownloadTaskRow) -> ApiResult<Option<UserSecret>> {
        if !row.encrypt {
            return Ok(None);
        }
        self.secrets_guard()
            .get(&row.task_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                ApiError::BadRequest("the passphrase for this encrypted task is no longer held".to_string())
            })
    }

    fn has_secret(&self, task_id: Uuid) -> bool {
        self.secrets_guard().contains_key(&task_id)
    }

    fn secrets_guard(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, UserSecret>> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn owned(&self, user_id: Uuid, task_id: Uuid) -> ApiResult<DownloadTaskRow> {
        self.metadata
            .get_download_task(task_id)
            .await?
            .filter(|row| row.user_id == user_id)
            .ok_or_else(|| ApiError::NotFound(format!("download {task_id}")))
    }
}

fn scratch_dir(row: &DownloadTaskRow) -> ApiResult<PathBuf> {
    row.local_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::Internal(format!("download {} has no scratch area", row.task_id)))
}

/// Virtual directory and file name for a file the torrent wrote at `relative`
/// inside its scratch area. The torrent's own folders become subdirectories of `base`.
fn torrent_placement(base: &str, relative: &Path) -> ApiResult<(String, String)> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(filename::sanitize(&part.to_string_lossy())?),
            Component::CurDir => {}
            other => {
                return Err(ApiError::BadRequest(format!(
                    "torrent path component {other:?} is not allowed"
                )));
            }
        }
    }
    let Some(name) = parts.pop() else {
        return Err(ApiError::BadRequest("torrent file has no name".to_string()));
    };
    let mut dir = base.trim_end_matches('/').to_string();
    for part in &parts {
        dir.push('/');
        dir.push_str(part);
    }
    Ok((normalize_virtual_path(&dir)?, name))
}

fn progress_of(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        Some(0) => 1.0,
        Some(total) => (bytes as f64 / total as f64).min(1.0),
        None => 0.0,
    }
}
