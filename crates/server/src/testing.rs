//! Shared fixtures for the service tests.

use crate::bootstrap;
use crate::disks::DiskSet;
use crate::permits::CryptoPermits;
use crate::upload::UploadPipeline;
use crate::users::UserService;
use std::path::PathBuf;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_core::hash::quick_hash_reader;
use stowage_core::upload::PrecheckRequest;
use stowage_core::SAMPLE_COUNT;
use stowage_metadata::{MetadataStore, SqliteStore};
use stowage_storage::FsSpaceProbe;
use tempfile::TempDir;
use uuid::Uuid;

pub(crate) const BCRYPT_TEST_COST: u32 = 4;

pub(crate) struct Harness {
    pub dir: TempDir,
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub disks: Arc<DiskSet>,
    pub users: Arc<UserService>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_testing(dir.path());
        adjust(&mut config);

        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(store);
        bootstrap::ensure_default_group(metadata.as_ref())
            .await
            .unwrap();
        let specs = bootstrap::register_disks(metadata.as_ref(), &config)
            .await
            .unwrap();
        let disks = DiskSet::new(specs, Arc::new(FsSpaceProbe), &config.file.temp_dir).unwrap();
        let users = UserService::with_cost(metadata.clone(), BCRYPT_TEST_COST);

        Self {
            dir,
            config: Arc::new(config),
            metadata,
            disks: Arc::new(disks),
            users: Arc::new(users),
        }
    }

    /// A user with `space` bytes, or unbounded for `None`.
    pub async fn user(&self, name: &str, space: Option<u64>) -> Uuid {
        self.users
            .create_user(name, Some(space.unwrap_or(0)))
            .await
            .unwrap()
            .user_id
    }

    pub fn uploads(&self) -> UploadPipeline {
        UploadPipeline::new(
            self.metadata.clone(),
            self.disks.clone(),
            self.config.clone(),
            self.users.clone(),
            CryptoPermits::new(2),
            None,
        )
    }

    /// Write `data` to a scratch file outside the disks.
    pub fn scratch_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let dir = self.dir.path().join("scratch");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Root of the only configured disk.
    pub fn disk_root(&self) -> PathBuf {
        self.disks.disks()[0].root.clone()
    }
}

/// A precheck the way a client would compute it for `data`.
pub(crate) fn precheck_for(data: &[u8], filename: &str, virtual_path: &str) -> PrecheckRequest {
    let signature = quick_hash_reader(data, SAMPLE_COUNT).unwrap();
    let sampled = signature.sampled_hex(SAMPLE_COUNT);
    PrecheckRequest {
        filename: filename.to_string(),
        size: data.len() as u64,
        chunk_signature: signature.signature.to_hex(),
        first_chunk_hash: sampled[0].clone(),
        second_chunk_hash: sampled[1].clone(),
        third_chunk_hash: sampled[2].clone(),
        virtual_path: virtual_path.to_string(),
        chunk_size: None,
    }
}

pub(crate) fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
