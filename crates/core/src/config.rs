//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// SHA-256 hex of the shared secret the front-end gateway presents.
    /// Generate with: `echo -n "your-secret" | sha256sum`
    #[serde(default)]
    pub gateway_token_hash: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            gateway_token_hash: String::new(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        let hash = self.gateway_token_hash.trim();
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(
                "server.gateway_token_hash must be a 64 character SHA-256 hex digest".to_string(),
            );
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database in WAL mode.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds. Advisory: slow queries are logged, not cancelled.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path must not be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// One storage disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Disk root directory.
    pub path: PathBuf,
    /// Blob subdirectory under the root.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Nominal capacity in bytes, used to rank disks.
    #[serde(default)]
    pub size: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Disks registered at startup, in priority order for ties.
    #[serde(default = "default_disks")]
    pub disks: Vec<DiskConfig>,
}

fn default_disks() -> Vec<DiskConfig> {
    vec![DiskConfig {
        path: PathBuf::from("./data/disk0"),
        data_dir: default_data_dir(),
        size: 0,
    }]
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disks: default_disks(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.disks.is_empty() {
            return Err("storage.disks must list at least one disk".to_string());
        }
        for disk in &self.disks {
            if disk.path.as_os_str().is_empty() {
                return Err("storage.disks[].path must not be empty".to_string());
            }
            if !is_plain_relative(&disk.data_dir) {
                return Err(format!(
                    "storage.disks[].data_dir must be a plain relative directory, got {:?}",
                    disk.data_dir
                ));
            }
        }
        Ok(())
    }
}

/// A single relative segment list without `..`, roots or prefixes.
fn is_plain_relative(dir: &str) -> bool {
    !dir.is_empty()
        && Path::new(dir)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Stored-file layout configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    /// Files above this size (GiB) are split into chunk files on disk.
    #[serde(default = "default_big_file_threshold_gib")]
    pub big_file_threshold_gib: f64,
    /// Chunk file size (GiB) for big files.
    #[serde(default = "default_big_chunk_size_gib")]
    pub big_chunk_size_gib: f64,
    /// Generate thumbnails for images.
    #[serde(default = "default_thumbnail")]
    pub thumbnail: bool,
    /// Scratch subdirectory under each disk root.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
}

fn default_big_file_threshold_gib() -> f64 {
    4.0
}

fn default_big_chunk_size_gib() -> f64 {
    1.0
}

fn default_thumbnail() -> bool {
    true
}

fn default_temp_dir() -> String {
    "temp".to_string()
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            big_file_threshold_gib: default_big_file_threshold_gib(),
            big_chunk_size_gib: default_big_chunk_size_gib(),
            thumbnail: default_thumbnail(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl FileConfig {
    /// Big-file threshold in bytes.
    pub fn big_file_threshold(&self) -> u64 {
        crate::gib(self.big_file_threshold_gib)
    }

    /// Big-file chunk size in bytes.
    pub fn big_chunk_size(&self) -> u64 {
        crate::gib(self.big_chunk_size_gib)
    }

    /// Validate file configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.big_chunk_size() == 0 {
            return Err("file.big_chunk_size_gib must be positive".to_string());
        }
        if self.big_file_threshold_gib < 0.0 {
            return Err("file.big_file_threshold_gib must not be negative".to_string());
        }
        if !is_plain_relative(&self.temp_dir) {
            return Err(format!(
                "file.temp_dir must be a plain relative directory, got {:?}",
                self.temp_dir
            ));
        }
        Ok(())
    }
}

/// Upload pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Default lifetime of an upload task.
    #[serde(default = "default_task_ttl_days")]
    pub task_ttl_days: u32,
    /// Extension granted by a renew.
    #[serde(default = "default_renew_days")]
    pub renew_days: u32,
    /// Chunk size handed to clients that do not pick one.
    #[serde(default = "default_upload_chunk_size")]
    pub chunk_size: u64,
    /// Chunk intake limit in megabits per second (0 = unlimited).
    #[serde(default)]
    pub rate_limit_mbps: f64,
}

fn default_task_ttl_days() -> u32 {
    7
}

fn default_renew_days() -> u32 {
    7
}

fn default_upload_chunk_size() -> u64 {
    5 * 1024 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            task_ttl_days: default_task_ttl_days(),
            renew_days: default_renew_days(),
            chunk_size: default_upload_chunk_size(),
            rate_limit_mbps: 0.0,
        }
    }
}

impl UploadConfig {
    /// Lifetime of a new task.
    pub fn task_ttl(&self) -> Duration {
        Duration::days(i64::from(self.task_ttl_days))
    }

    /// Extension granted by a renew.
    pub fn renew_period(&self) -> Duration {
        Duration::days(i64::from(self.renew_days))
    }

    /// Validate upload configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_ttl_days == 0 {
            return Err("upload.task_ttl_days must be at least 1".to_string());
        }
        if self.chunk_size == 0 {
            return Err("upload.chunk_size must be positive".to_string());
        }
        if self.rate_limit_mbps < 0.0 {
            return Err("upload.rate_limit_mbps must not be negative".to_string());
        }
        Ok(())
    }
}

/// Offline download configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Retries per segment before the task fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Segment size for ranged downloads.
    #[serde(default = "default_download_chunk_size")]
    pub chunk_size: u64,
    /// Concurrent segment workers per task.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Timeout for probes and segment requests.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Shared download limit in megabits per second (0 = unlimited).
    #[serde(default)]
    pub rate_limit_mbps: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_download_chunk_size() -> u64 {
    256 * 1024 * 1024
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_sec() -> u64 {
    300
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            chunk_size: default_download_chunk_size(),
            max_concurrent: default_max_concurrent(),
            timeout_sec: default_timeout_sec(),
            rate_limit_mbps: 0.0,
        }
    }
}

impl DownloadConfig {
    /// Request timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_sec)
    }

    /// Validate download configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("download.chunk_size must be positive".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("download.max_concurrent must be at least 1".to_string());
        }
        if self.timeout_sec == 0 {
            return Err("download.timeout_sec must be at least 1".to_string());
        }
        if self.rate_limit_mbps < 0.0 {
            return Err("download.rate_limit_mbps must not be negative".to_string());
        }
        Ok(())
    }
}

/// Convert a megabit-per-second limit into bytes per second. `None` means unlimited.
pub fn mbps_to_bytes_per_sec(mbps: f64) -> Option<u64> {
    if mbps <= 0.0 {
        return None;
    }
    Some(((mbps * 1_000_000.0) / 8.0).max(1.0) as u64)
}

/// Recycle bin configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecycleConfig {
    /// Recycled entries older than this are purged by the scheduler.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl RecycleConfig {
    /// Retention window.
    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }
}

/// Lifecycle scheduler configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run background jobs.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Seconds between job rounds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Interval between job rounds.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// Validate scheduler configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.interval_secs < 60 {
            return Err(format!(
                "scheduler.interval_secs ({}) must be at least 60",
                self.interval_secs
            ));
        }
        Ok(())
    }
}

/// Play token configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayConfig {
    /// Play token lifetime.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    86400
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl PlayConfig {
    /// Play token lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.token_ttl_secs).unwrap_or(i64::MAX))
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub file: FileConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub recycle: RecycleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub play: PlayConfig,
}

impl AppConfig {
    /// Validate every section, returning the first error.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.metadata.validate()?;
        self.storage.validate()?;
        self.file.validate()?;
        self.upload.validate()?;
        self.download.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.** One disk under `root/disk0`, SQLite at
    /// `root/metadata.db`, scheduler disabled, and the gateway hash of
    /// `"test-gateway-token"`.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            server: ServerConfig {
                // SHA256 of "test-gateway-token"
                gateway_token_hash: crate::token::sha256_hex("test-gateway-token"),
                ..ServerConfig::default()
            },
            metadata: MetadataConfig::Sqlite {
                path: root.join("metadata.db"),
                query_timeout_secs: default_sqlite_query_timeout_secs(),
            },
            storage: StorageConfig {
                disks: vec![DiskConfig {
                    path: root.join("disk0"),
                    data_dir: default_data_dir(),
                    size: 1 << 40,
                }],
            },
            file: FileConfig {
                thumbnail: false,
                ..FileConfig::default()
            },
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.upload.task_ttl_days, 7);
        assert_eq!(config.upload.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.download.timeout_sec, 300);
        assert_eq!(config.play.token_ttl_secs, 86400);
        assert_eq!(config.scheduler.interval_secs, 3600);
        assert_eq!(config.storage.disks[0].data_dir, "data");
        assert!(config.server.metrics_enabled);
    }

    #[test]
    fn test_partial_section_uses_field_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"download": {"max_concurrent": 8}, "file": {"thumbnail": false}}"#,
        )
        .unwrap();
        assert_eq!(config.download.max_concurrent, 8);
        assert_eq!(config.download.max_retries, 3);
        assert!(!config.file.thumbnail);
        assert_eq!(config.file.temp_dir, "temp");
    }

    #[test]
    fn test_metadata_config_tagged() {
        let config: MetadataConfig =
            serde_json::from_str(r#"{"type": "sqlite", "path": "/tmp/x.db"}"#).unwrap();
        let MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } = config;
        assert_eq!(path, PathBuf::from("/tmp/x.db"));
        assert_eq!(query_timeout_secs, Some(600));
    }

    #[test]
    fn test_gateway_hash_required() {
        let mut config = AppConfig::for_testing(Path::new("/tmp/stowage"));
        assert!(config.validate().is_ok());
        config.server.gateway_token_hash = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_must_stay_relative() {
        let mut storage = StorageConfig::default();
        storage.disks[0].data_dir = "../escape".to_string();
        assert!(storage.validate().is_err());

        let file = FileConfig {
            temp_dir: "/abs".to_string(),
            ..FileConfig::default()
        };
        assert!(file.validate().is_err());
    }

    #[test]
    fn test_size_helpers() {
        let file = FileConfig::default();
        assert_eq!(file.big_chunk_size(), 1024 * 1024 * 1024);
        assert_eq!(mbps_to_bytes_per_sec(0.0), None);
        assert_eq!(mbps_to_bytes_per_sec(8.0), Some(1_000_000));
        assert_eq!(UploadConfig::default().task_ttl(), Duration::days(7));
    }
}
