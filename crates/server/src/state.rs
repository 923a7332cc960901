//! Application state shared across handlers.

use crate::disks::DiskSet;
use crate::download::{DownloadEngine, HttpFetcher, TorrentClient, torrent};
use crate::packaging::PackageRegistry;
use crate::permits::CryptoPermits;
use crate::quota::QuotaController;
use crate::ratelimit::BandwidthLimiter;
use crate::reader::{FileReader, PlayTokenCache};
use crate::recycle::RecycleService;
use crate::scheduler::{JobRegistry, LifecycleScheduler};
use crate::shares::ShareService;
use crate::upload::UploadPipeline;
use crate::users::UserService;
use anyhow::Context;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_metadata::MetadataStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub disks: Arc<DiskSet>,
    pub users: Arc<UserService>,
    pub quota: Arc<QuotaController>,
    pub uploads: Arc<UploadPipeline>,
    pub reader: Arc<FileReader>,
    pub downloads: Arc<DownloadEngine>,
    pub recycle: Arc<RecycleService>,
    pub shares: Arc<ShareService>,
    pub packages: Arc<PackageRegistry>,
    pub scheduler: Arc<LifecycleScheduler>,
    /// Job registry for panic detection.
    pub jobs: Arc<JobRegistry>,
}

impl AppState {
    /// Wire every service with the production defaults for this build.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        disks: Arc<DiskSet>,
    ) -> anyhow::Result<Self> {
        let scratch = disks
            .disks()
            .first()
            .map(|disk| disk.root.join(&config.file.temp_dir).join("torrent"))
            .context("no disks registered")?;
        let torrents = torrent::default_client(&scratch);
        let users = Arc::new(UserService::new(metadata.clone()));
        Self::with_parts(config, metadata, disks, users, torrents)
    }

    /// Wire the services around a given user service and torrent client.
    pub fn with_parts(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        disks: Arc<DiskSet>,
        users: Arc<UserService>,
        torrents: Arc<dyn TorrentClient>,
    ) -> anyhow::Result<Self> {
        for (section, mbps) in [
            ("upload", config.upload.rate_limit_mbps),
            ("download", config.download.rate_limit_mbps),
        ] {
            if mbps > 0.0 {
                tracing::info!(section, mbps, "bandwidth limit enabled");
            }
        }
        let config = Arc::new(config);
        let permits = CryptoPermits::from_cpus();
        let upload_limiter = BandwidthLimiter::from_mbps(config.upload.rate_limit_mbps).map(Arc::new);
        let download_limiter =
            BandwidthLimiter::from_mbps(config.download.rate_limit_mbps).map(Arc::new);

        let uploads = Arc::new(UploadPipeline::new(
            metadata.clone(),
            disks.clone(),
            config.clone(),
            users.clone(),
            permits.clone(),
            upload_limiter,
        ));
        let tokens = Arc::new(PlayTokenCache::new(config.play.token_ttl()));
        let reader = Arc::new(FileReader::new(
            metadata.clone(),
            disks.clone(),
            users.clone(),
            permits,
            tokens.clone(),
        ));
        let http = HttpFetcher::new(&config.download, download_limiter)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("failed to build the download client")?;
        let downloads = Arc::new(DownloadEngine::new(
            metadata.clone(),
            disks.clone(),
            uploads.clone(),
            users.clone(),
            Arc::new(http),
            torrents,
        ));
        let recycle = Arc::new(RecycleService::new(metadata.clone(), disks.clone()));
        let shares = Arc::new(ShareService::new(metadata.clone(), users.bcrypt_cost()));
        let packages = Arc::new(PackageRegistry::new(
            metadata.clone(),
            disks.clone(),
            reader.clone(),
        ));
        let jobs = Arc::new(JobRegistry::new());
        let scheduler = Arc::new(LifecycleScheduler::new(
            config.clone(),
            metadata.clone(),
            disks.clone(),
            recycle.clone(),
            tokens,
            packages.clone(),
            jobs.clone(),
        ));

        Ok(Self {
            quota: Arc::new(QuotaController::new(metadata.clone())),
            config,
            metadata,
            disks,
            users,
            uploads,
            reader,
            downloads,
            recycle,
            shares,
            packages,
            scheduler,
            jobs,
        })
    }
}
