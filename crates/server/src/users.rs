//! User accounts and file passphrases.

use crate::error::{ApiError, ApiResult};
use std::sync::Arc;
use stowage_core::UserSecret;
use stowage_core::crypto::derive_user_key;
use stowage_metadata::MetadataStore;
use stowage_metadata::models::{UserRow, to_db_size};
use stowage_metadata::repos::{GroupRepo, UserRepo};
use time::OffsetDateTime;
use uuid::Uuid;

/// Bytes of the random per-user key salt.
const USER_SALT_BYTES: usize = 16;

pub struct UserService {
    metadata: Arc<dyn MetadataStore>,
    bcrypt_cost: u32,
}

impl UserService {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self::with_cost(metadata, bcrypt::DEFAULT_COST)
    }

    /// Use a cheaper bcrypt cost. Tests only.
    pub fn with_cost(metadata: Arc<dyn MetadataStore>, bcrypt_cost: u32) -> Self {
        Self {
            metadata,
            bcrypt_cost,
        }
    }

    pub fn bcrypt_cost(&self) -> u32 {
        self.bcrypt_cost
    }

    /// Create a user in the default group. `space` of `None` takes the group default.
    #[tracing::instrument(skip(self))]
    pub async fn create_user(&self, username: &str, space: Option<u64>) -> ApiResult<UserRow> {
        if username.trim().is_empty() {
            return Err(ApiError::BadRequest("username must not be empty".to_string()));
        }
        let group = self
            .metadata
            .get_default_group()
            .await?
            .ok_or_else(|| ApiError::Internal("no default group".to_string()))?;
        let space = match space {
            Some(space) => to_db_size(space)?,
            None => group.default_space,
        };
        let now = OffsetDateTime::now_utc();
        let user = UserRow {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            group_id: group.group_id,
            space,
            free_space: space,
            file_passphrase_hash: None,
            file_salt: None,
            state: "normal".to_string(),
            created_at: now,
            updated_at: now,
        };
        self.metadata.create_user(&user).await?;
        tracing::info!(user_id = %user.user_id, space, "created user");
        Ok(user)
    }

    pub async fn get(&self, user_id: Uuid) -> ApiResult<UserRow> {
        self.metadata
            .get_user(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))
    }

    /// Store a bcrypt hash of `passphrase` and a fresh key salt.
    ///
    /// Refused while the user owns encrypted files, whose keys derive from the old one.
    #[tracing::instrument(skip(self, passphrase))]
    pub async fn set_file_passphrase(&self, user_id: Uuid, passphrase: &str) -> ApiResult<()> {
        if passphrase.is_empty() {
            return Err(ApiError::BadRequest("passphrase must not be empty".to_string()));
        }
        let user = self.get(user_id).await?;
        if user.file_passphrase_hash.is_some()
            && self.metadata.encrypted_file_count(user_id).await? > 0
        {
            return Err(ApiError::Conflict(
                "cannot change the file passphrase while encrypted files exist".to_string(),
            ));
        }

        let cost = self.bcrypt_cost;
        let secret = passphrase.to_string();
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(secret, cost))
            .await?
            .map_err(|e| ApiError::Internal(format!("bcrypt failed: {e}")))?;
        let salt = stowage_core::token::random_hex(USER_SALT_BYTES);
        self.metadata
            .set_file_passphrase(user_id, &hash, &salt, OffsetDateTime::now_utc())
            .await?;
        tracing::info!(user_id = %user_id, "file passphrase set");
        Ok(())
    }

    /// Verify `passphrase` and derive the user's file secret.
    pub async fn unlock(&self, user_id: Uuid, passphrase: &str) -> ApiResult<UserSecret> {
        let user = self.get(user_id).await?;
        let (Some(hash), Some(salt_hex)) = (user.file_passphrase_hash, user.file_salt) else {
            return Err(ApiError::BadRequest("file passphrase not set".to_string()));
        };
        let salt = hex::decode(&salt_hex)
            .map_err(|e| ApiError::Internal(format!("stored salt is not hex: {e}")))?;

        let secret = passphrase.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            let ok = bcrypt::verify(&secret, &hash)?;
            Ok::<_, bcrypt::BcryptError>(ok.then(|| derive_user_key(&secret, &salt)))
        })
        .await?
        .map_err(|e| ApiError::Internal(format!("bcrypt failed: {e}")))?;

        verified.ok_or_else(|| ApiError::Forbidden("incorrect file passphrase".to_string()))
    }
}
