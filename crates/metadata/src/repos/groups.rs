//! Group and permission repository.

use crate::error::MetadataResult;
use crate::models::GroupRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for groups and their permissions.
#[async_trait]
pub trait GroupRepo: Send + Sync {
    /// Create a group. A group created with `is_default` must be the first default.
    async fn create_group(&self, group: &GroupRow) -> MetadataResult<()>;

    /// Get a group by ID.
    async fn get_group(&self, group_id: Uuid) -> MetadataResult<Option<GroupRow>>;

    /// Get the group new users are assigned to.
    async fn get_default_group(&self) -> MetadataResult<Option<GroupRow>>;

    /// Atomically move the default flag to `group_id`.
    async fn set_default_group(&self, group_id: Uuid) -> MetadataResult<()>;

    /// Grant a permission characteristic to a group. Idempotent.
    async fn grant_permission(&self, group_id: Uuid, characteristic: &str) -> MetadataResult<()>;

    /// Revoke a permission characteristic from a group.
    async fn revoke_permission(&self, group_id: Uuid, characteristic: &str)
    -> MetadataResult<()>;

    /// Permission characteristics granted to a group.
    async fn group_permissions(&self, group_id: Uuid) -> MetadataResult<Vec<String>>;
}
