//! Virtual directory tree repository.

use crate::error::MetadataResult;
use crate::models::VirtualPathRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for per-user directory trees.
#[async_trait]
pub trait VirtualPathRepo: Send + Sync {
    /// Get or create the user's root.
    async fn ensure_root(&self, user_id: Uuid) -> MetadataResult<VirtualPathRow>;

    /// Get or create every directory on `path` (`/a/b`) and return the leaf.
    ///
    /// Soft-deleted directories on the way are revived.
    async fn ensure_path(&self, user_id: Uuid, path: &str) -> MetadataResult<VirtualPathRow>;

    /// Get a directory by ID.
    async fn get_path(&self, path_id: Uuid) -> MetadataResult<Option<VirtualPathRow>>;

    /// Live child directories.
    async fn list_children(&self, path_id: Uuid) -> MetadataResult<Vec<VirtualPathRow>>;

    /// Re-parent a directory. Rejects moves under itself or a descendant.
    async fn move_path(&self, user_id: Uuid, path_id: Uuid, new_parent: Uuid)
    -> MetadataResult<()>;

    /// IDs of a directory and all of its descendants.
    async fn subtree_ids(&self, path_id: Uuid) -> MetadataResult<Vec<Uuid>>;
}
