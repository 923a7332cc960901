//! User repository.

use crate::error::MetadataResult;
use crate::models::UserRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for user records and quota figures.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Create a user. `free_space` should equal `space` for a fresh account.
    async fn create_user(&self, user: &UserRow) -> MetadataResult<()>;

    /// Get a user by ID.
    async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>>;

    /// Get a user by name.
    async fn get_user_by_name(&self, username: &str) -> MetadataResult<Option<UserRow>>;

    /// Store the bcrypt passphrase hash and key salt.
    async fn set_file_passphrase(
        &self,
        user_id: Uuid,
        passphrase_hash: &str,
        salt_hex: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Number of encrypted files the user still references (live or recycled).
    async fn encrypted_file_count(&self, user_id: Uuid) -> MetadataResult<u64>;

    /// Union of the permission characteristics of the user's group.
    async fn effective_permissions(&self, user_id: Uuid) -> MetadataResult<Vec<String>>;
}
