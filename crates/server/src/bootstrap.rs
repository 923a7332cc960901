//! Startup: default group, disk registration and crash recovery.

use anyhow::{Context, Result, bail};
use stowage_core::Permission;
use stowage_core::config::AppConfig;
use stowage_metadata::MetadataStore;
use stowage_metadata::models::{DiskRow, GroupRow, from_db_size, to_db_size};
use stowage_metadata::repos::{DiskRepo, DownloadTaskRepo, GroupRepo};
use stowage_storage::DiskSpec;
use time::OffsetDateTime;
use uuid::Uuid;

/// Name of the group created on first start.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Ensure a default group exists. A freshly created one holds every permission
/// and an unbounded default space.
pub async fn ensure_default_group(metadata: &dyn MetadataStore) -> Result<GroupRow> {
    if let Some(group) = metadata.get_default_group().await? {
        tracing::debug!(group_id = %group.group_id, "Default group already exists");
        return Ok(group);
    }

    let group = GroupRow {
        group_id: Uuid::new_v4(),
        name: DEFAULT_GROUP_NAME.to_string(),
        is_default: true,
        default_space: 0,
        created_at: OffsetDateTime::now_utc(),
    };
    metadata.create_group(&group).await?;
    for permission in Permission::ALL {
        metadata
            .grant_permission(group.group_id, permission.as_str())
            .await?;
    }
    tracing::info!(group_id = %group.group_id, "Default group created");
    Ok(group)
}

/// Register the configured disks and return them with their durable ids.
///
/// Disks are matched by root; a root already registered keeps its id.
pub async fn register_disks(metadata: &dyn MetadataStore, config: &AppConfig) -> Result<Vec<DiskSpec>> {
    let configured = stowage_storage::configured_disks(&config.storage)
        .context("invalid storage configuration")?;
    if configured.is_empty() {
        bail!("no disks configured");
    }

    let mut disks = Vec::with_capacity(configured.len());
    for spec in configured {
        tokio::fs::create_dir_all(spec.data_root())
            .await
            .with_context(|| format!("failed to create {}", spec.data_root().display()))?;
        let row = metadata
            .register_disk(&DiskRow {
                disk_id: spec.id,
                root: spec.root.to_string_lossy().into_owned(),
                data_dir: spec.data_dir.clone(),
                size: to_db_size(spec.size)?,
                created_at: OffsetDateTime::now_utc(),
            })
            .await?;
        if row.data_dir != spec.data_dir {
            tracing::warn!(
                root = %row.root,
                registered = %row.data_dir,
                configured = %spec.data_dir,
                "data_dir changed for a registered disk; keeping the registered one"
            );
        }
        tracing::info!(disk_id = %row.disk_id, root = %row.root, "Disk registered");
        disks.push(DiskSpec {
            id: row.disk_id,
            root: spec.root,
            data_dir: row.data_dir,
            size: from_db_size(row.size)?.max(spec.size),
        });
    }
    Ok(disks)
}

/// Recover tasks interrupted by the previous shutdown.
///
/// Downloads caught mid-transfer are parked as paused so a user can resume
/// them. Stale upload tasks are left to the scheduled cleanup.
pub async fn recover(metadata: &dyn MetadataStore) -> Result<u64> {
    let paused = metadata
        .pause_interrupted_downloads(OffsetDateTime::now_utc())
        .await?;
    if paused > 0 {
        tracing::info!(paused, "Interrupted downloads parked as paused");
    }
    Ok(paused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_metadata::SqliteStore;

    #[tokio::test]
    async fn default_group_is_created_once_with_every_permission() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("meta.db"), None)
            .await
            .unwrap();

        let first = ensure_default_group(&store).await.unwrap();
        let second = ensure_default_group(&store).await.unwrap();
        assert_eq!(first.group_id, second.group_id);

        let granted = store.group_permissions(first.group_id).await.unwrap();
        assert_eq!(granted.len(), Permission::ALL.len());
    }

    #[tokio::test]
    async fn disks_keep_their_ids_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("meta.db"), None)
            .await
            .unwrap();
        let config = AppConfig::for_testing(dir.path());

        let first = register_disks(&store, &config).await.unwrap();
        let second = register_disks(&store, &config).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert!(first[0].data_root().is_dir());
    }
}
