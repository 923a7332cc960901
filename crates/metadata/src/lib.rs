//! Metadata store abstraction and the SQLite implementation for stowage.
//!
//! This crate provides the control-plane data model:
//! - Users, groups, permissions and quota accounting
//! - Physical file records, chunk records and per-user links
//! - Per-user virtual directory trees
//! - Recycle bin entries and reference-counted purges
//! - Share links
//! - Upload and offline download task state

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use stowage_core::config::MetadataConfig;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("metadata.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
