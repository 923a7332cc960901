//! Share link repository.

use crate::error::MetadataResult;
use crate::models::ShareRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for share links.
#[async_trait]
pub trait ShareRepo: Send + Sync {
    /// Insert a share. Fails with `AlreadyExists` on a token collision.
    async fn create_share(&self, share: &ShareRow) -> MetadataResult<()>;

    /// Look up a share by token.
    async fn get_share_by_token(&self, token: &str) -> MetadataResult<Option<ShareRow>>;

    /// Increment the download counter.
    async fn increment_share_downloads(&self, share_id: Uuid) -> MetadataResult<()>;

    /// A user's shares.
    async fn list_shares(&self, user_id: Uuid) -> MetadataResult<Vec<ShareRow>>;

    /// Delete a share owned by `user_id`.
    async fn delete_share(&self, user_id: Uuid, share_id: Uuid) -> MetadataResult<()>;
}
