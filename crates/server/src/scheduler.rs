//! Periodic lifecycle jobs.

use crate::disks::DiskSet;
use crate::error::ApiResult;
use crate::metrics;
use crate::packaging::PackageRegistry;
use crate::reader::PlayTokenCache;
use crate::recycle::RecycleService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::config::AppConfig;
use stowage_metadata::MetadataStore;
use stowage_metadata::repos::UploadTaskRepo;
use stowage_storage::remove_tree;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    UploadTaskCleanup,
    RecyclePurge,
    PlayTokenSweep,
    PackageSweep,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        Self::UploadTaskCleanup,
        Self::RecyclePurge,
        Self::PlayTokenSweep,
        Self::PackageSweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadTaskCleanup => "upload_task_cleanup",
            Self::RecyclePurge => "recycle_purge",
            Self::PlayTokenSweep => "play_token_sweep",
            Self::PackageSweep => "package_sweep",
        }
    }
}

/// Tracks spawned job tasks and notices the ones that panicked.
///
/// A panicked job would otherwise vanish silently; the watchdog logs and
/// counts it and frees its slot so the next round runs it again.
#[derive(Default)]
pub struct JobRegistry {
    tasks: Mutex<HashMap<JobKind, JoinHandle<()>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job of `kind` is still running.
    pub async fn is_running(&self, kind: JobKind) -> bool {
        self.tasks
            .lock()
            .await
            .get(&kind)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn register(&self, kind: JobKind, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(kind, handle);
    }

    /// Spawn the watchdog. Keep the handle to keep it alive.
    pub fn spawn_watchdog(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                        self.check_tasks().await;
                    }
                }
            }
        })
    }

    /// Reap finished jobs. Returns how many of them panicked.
    pub async fn check_tasks(&self) -> usize {
        let finished: Vec<(JobKind, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            let done: Vec<JobKind> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(kind, _)| *kind)
                .collect();
            done.into_iter()
                .filter_map(|kind| tasks.remove(&kind).map(|handle| (kind, handle)))
                .collect()
        };

        let mut panicked = 0;
        for (kind, handle) in finished {
            match handle.await {
                Ok(()) => {
                    tracing::debug!(job = kind.as_str(), "lifecycle job completed");
                }
                Err(join_err) if join_err.is_panic() => {
                    panicked += 1;
                    metrics::SCHEDULER_JOB_PANICS.inc();
                    tracing::error!(job = kind.as_str(), panic = ?join_err, "lifecycle job panicked");
                }
                Err(join_err) => {
                    tracing::warn!(job = kind.as_str(), error = ?join_err, "lifecycle job was cancelled");
                }
            }
        }
        panicked
    }
}

/// Runs the lifecycle jobs every `scheduler.interval_secs`.
pub struct LifecycleScheduler {
    config: Arc<AppConfig>,
    metadata: Arc<dyn MetadataStore>,
    disks: Arc<DiskSet>,
    recycle: Arc<RecycleService>,
    tokens: Arc<PlayTokenCache>,
    packages: Arc<PackageRegistry>,
    jobs: Arc<JobRegistry>,
}

impl LifecycleScheduler {
    pub fn new(
        config: Arc<AppConfig>,
        metadata: Arc<dyn MetadataStore>,
        disks: Arc<DiskSet>,
        recycle: Arc<RecycleService>,
        tokens: Arc<PlayTokenCache>,
        packages: Arc<PackageRegistry>,
        jobs: Arc<JobRegistry>,
    ) -> Self {
        Self {
            config,
            metadata,
            disks,
            recycle,
            tokens,
            packages,
            jobs,
        }
    }

    /// Spawn the interval loop. The first round runs immediately.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.scheduler.interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("lifecycle scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => self.tick().await,
                }
            }
        })
    }

    /// Spawn every job that is not already running.
    pub async fn tick(self: &Arc<Self>) {
        for kind in JobKind::ALL {
            if self.jobs.is_running(kind).await {
                tracing::debug!(job = kind.as_str(), "previous run still active, skipping");
                continue;
            }
            let scheduler = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = scheduler.run_job(kind).await {
                    tracing::warn!(job = kind.as_str(), error = %e, "lifecycle job failed");
                }
            });
            self.jobs.register(kind, handle).await;
        }
    }

    /// Run one job now. Returns the number of items it handled.
    pub async fn run_job(&self, kind: JobKind) -> ApiResult<usize> {
        let now = OffsetDateTime::now_utc();
        metrics::SCHEDULER_JOB_RUNS.with_label_values(&[kind.as_str()]).inc();
        let handled = match kind {
            JobKind::UploadTaskCleanup => self.cleanup_upload_tasks(now).await?,
            JobKind::RecyclePurge => {
                self.recycle
                    .purge_expired(now - self.config.recycle.retention())
                    .await?
                    .purged
            }
            JobKind::PlayTokenSweep => self.tokens.sweep(now),
            JobKind::PackageSweep => self.packages.sweep(now - time::Duration::days(1)).await,
        };
        if handled > 0 {
            tracing::info!(job = kind.as_str(), handled, "lifecycle job finished");
        }
        Ok(handled)
    }

    /// Remove expired, failed and aborted upload tasks along with their scratch.
    pub async fn cleanup_upload_tasks(&self, now: OffsetDateTime) -> ApiResult<usize> {
        let stale = self.metadata.list_stale_upload_tasks(now).await?;
        let mut removed = 0;
        for task in stale {
            let scratch = match self.disks.resolve(task.disk_id, &task.temp_dir).await {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, error = %e, "upload scratch not resolvable");
                    None
                }
            };
            if let Some(scratch) = scratch {
                if let Err(e) = remove_tree(&scratch).await {
                    tracing::warn!(task_id = %task.task_id, error = %e, "failed to remove upload scratch");
                    continue;
                }
            }
            self.metadata.delete_upload_task(task.task_id).await?;
            removed += 1;
        }
        Ok(removed)
    }
}
