//! User file link repository.

use crate::error::MetadataResult;
use crate::models::UserFileRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for per-user file links.
#[async_trait]
pub trait UserFileRepo: Send + Sync {
    /// The user's live link to a physical file.
    async fn get_user_file(&self, user_id: Uuid, file_id: Uuid)
    -> MetadataResult<Option<UserFileRow>>;

    /// Get a link by its own ID.
    async fn get_user_file_by_id(&self, user_file_id: Uuid)
    -> MetadataResult<Option<UserFileRow>>;

    /// Any live public link to a physical file.
    async fn find_public_link(&self, file_id: Uuid) -> MetadataResult<Option<UserFileRow>>;

    /// Live links in a directory.
    async fn list_in_path(&self, user_id: Uuid, path_id: Uuid) -> MetadataResult<Vec<UserFileRow>>;

    /// Live link names in a directory, for collision checks.
    async fn names_in_path(&self, user_id: Uuid, path_id: Uuid) -> MetadataResult<Vec<String>>;

    /// Mark a link public or private.
    async fn set_public(&self, user_file_id: Uuid, is_public: bool) -> MetadataResult<()>;

    /// Create a rename copy of a live link in another directory. Quota is debited.
    async fn copy_user_file(
        &self,
        source: Uuid,
        new_id: Uuid,
        name: &str,
        path_id: Uuid,
    ) -> MetadataResult<UserFileRow>;

    /// Sum of file sizes over every non-purged link of the user (live and recycled).
    async fn referenced_bytes(&self, user_id: Uuid) -> MetadataResult<i64>;
}
