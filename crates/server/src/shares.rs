//! Share links.

use crate::error::{ApiError, ApiResult};
use crate::permissions;
use std::sync::Arc;
use stowage_core::Permission;
use stowage_metadata::models::ShareRow;
use stowage_metadata::repos::{FileRepo, ShareRepo, UserFileRepo};
use stowage_metadata::{MetadataError, MetadataStore};
use time::OffsetDateTime;
use uuid::Uuid;

/// Token collisions tolerated before giving up.
const TOKEN_ATTEMPTS: usize = 4;

pub struct ShareService {
    metadata: Arc<dyn MetadataStore>,
    bcrypt_cost: u32,
}

impl ShareService {
    pub fn new(metadata: Arc<dyn MetadataStore>, bcrypt_cost: u32) -> Self {
        Self {
            metadata,
            bcrypt_cost,
        }
    }

    /// Share a file the caller owns. Encrypted files cannot be shared.
    #[tracing::instrument(skip(self, password), fields(user_id = %user_id, file_id = %file_id))]
    pub async fn create(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        ttl: Option<time::Duration>,
        password: Option<&str>,
    ) -> ApiResult<ShareRow> {
        permissions::require(self.metadata.as_ref(), user_id, Permission::ShareCreate).await?;
        let link = self
            .metadata
            .get_user_file(user_id, file_id)
            .await?
            .ok_or_else(|| ApiError::NotOwned(format!("file {file_id}")))?;
        let file = self
            .metadata
            .get_file(file_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("file {file_id}")))?;
        if file.is_encrypted {
            return Err(ApiError::Forbidden("encrypted files cannot be shared".to_string()));
        }
        if ttl.is_some_and(|ttl| !ttl.is_positive()) {
            return Err(ApiError::BadRequest("share ttl must be positive".to_string()));
        }

        let password_hash = match password.filter(|p| !p.is_empty()) {
            Some(password) => {
                let cost = self.bcrypt_cost;
                let password = password.to_string();
                tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
                    .await?
                    .map_err(|e| ApiError::Internal(format!("bcrypt failed: {e}")))?
            }
            None => String::new(),
        };

        let now = OffsetDateTime::now_utc();
        let mut share = ShareRow {
            share_id: Uuid::new_v4(),
            user_id,
            user_file_id: link.user_file_id,
            file_id,
            token: String::new(),
            password_hash,
            expires_at: ttl.map(|ttl| now + ttl),
            download_count: 0,
            created_at: now,
        };
        for _ in 0..TOKEN_ATTEMPTS {
            share.token = stowage_core::token::generate();
            match self.metadata.create_share(&share).await {
                Ok(()) => {
                    tracing::info!(share_id = %share.share_id, "share created");
                    return Ok(share);
                }
                Err(MetadataError::AlreadyExists(_)) => {
                    tracing::warn!("share token collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApiError::Internal("could not allocate a unique share token".to_string()))
    }

    /// Check expiry and password, then count the download.
    ///
    /// Unknown and expired tokens look the same to the caller.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(&self, token: &str, password: Option<&str>) -> ApiResult<ShareRow> {
        let share = self
            .metadata
            .get_share_by_token(token)
            .await?
            .ok_or_else(|| ApiError::NotFound("share".to_string()))?;
        if share
            .expires_at
            .is_some_and(|at| at <= OffsetDateTime::now_utc())
        {
            return Err(ApiError::NotFound("share".to_string()));
        }

        if !share.password_hash.is_empty() {
            let Some(password) = password else {
                return Err(ApiError::Forbidden("share password required".to_string()));
            };
            let password = password.to_string();
            let hash = share.password_hash.clone();
            let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
                .await?
                .map_err(|e| ApiError::Internal(format!("bcrypt failed: {e}")))?;
            if !ok {
                return Err(ApiError::Forbidden("incorrect share password".to_string()));
            }
        }

        self.metadata.increment_share_downloads(share.share_id).await?;
        Ok(ShareRow {
            download_count: share.download_count + 1,
            ..share
        })
    }

    pub async fn list(&self, user_id: Uuid) -> ApiResult<Vec<ShareRow>> {
        Ok(self.metadata.list_shares(user_id).await?)
    }

    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn revoke(&self, user_id: Uuid, share_id: Uuid) -> ApiResult<()> {
        self.metadata.delete_share(user_id, share_id).await?;
        tracing::info!(share_id = %share_id, "share revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BCRYPT_TEST_COST, Harness};

    async fn shared_file(h: &Harness, owner: Uuid) -> Uuid {
        let src = h.scratch_file("report", b"quarterly numbers");
        h.uploads()
            .ingest_local_file(owner, &src, "report.txt", "/", None)
            .await
            .unwrap()
            .file_id
    }

    #[tokio::test]
    async fn password_protected_share_counts_downloads() {
        let h = Harness::new().await;
        let shares = ShareService::new(h.metadata.clone(), BCRYPT_TEST_COST);
        let alice = h.user("alice", None).await;
        let file_id = shared_file(&h, alice).await;

        let share = shares.create(alice, file_id, None, Some("open sesame")).await.unwrap();
        assert!(!share.password_hash.is_empty());
        assert_ne!(share.password_hash, "open sesame");

        assert!(matches!(
            shares.resolve(&share.token, None).await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            shares.resolve(&share.token, Some("wrong")).await,
            Err(ApiError::Forbidden(_))
        ));
        let resolved = shares.resolve(&share.token, Some("open sesame")).await.unwrap();
        assert_eq!(resolved.download_count, 1);
        let again = shares.resolve(&share.token, Some("open sesame")).await.unwrap();
        assert_eq!(again.download_count, 2);
    }

    #[tokio::test]
    async fn expired_and_revoked_shares_are_gone() {
        let h = Harness::new().await;
        let shares = ShareService::new(h.metadata.clone(), BCRYPT_TEST_COST);
        let alice = h.user("alice", None).await;
        let file_id = shared_file(&h, alice).await;

        let short = shares
            .create(alice, file_id, Some(time::Duration::milliseconds(1)), None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            shares.resolve(&short.token, None).await,
            Err(ApiError::NotFound(_))
        ));

        let open = shares.create(alice, file_id, None, None).await.unwrap();
        assert_ne!(open.token, short.token);
        assert_eq!(shares.list(alice).await.unwrap().len(), 2);
        shares.revoke(alice, open.share_id).await.unwrap();
        assert!(matches!(
            shares.resolve(&open.token, None).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_owners_share() {
        let h = Harness::new().await;
        let shares = ShareService::new(h.metadata.clone(), BCRYPT_TEST_COST);
        let alice = h.user("alice", None).await;
        let bob = h.user("bob", None).await;
        let file_id = shared_file(&h, alice).await;
        assert!(matches!(
            shares.create(bob, file_id, None, None).await,
            Err(ApiError::NotOwned(_))
        ));
        assert!(matches!(
            shares.create(alice, file_id, Some(time::Duration::ZERO), None).await,
            Err(ApiError::BadRequest(_))
        ));
    }
}
