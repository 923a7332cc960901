//! Quota checks and drift audits.
//!
//! Debits and credits happen inside the metadata transactions; this module
//! only refuses early and reports drift.

use crate::error::{ApiError, ApiResult};
use serde::Serialize;
use std::sync::Arc;
use stowage_metadata::MetadataStore;
use stowage_metadata::models::{UserRow, from_db_size, to_db_size};
use stowage_metadata::repos::{UserFileRepo, UserRepo};
use uuid::Uuid;

/// Result of recomputing a user's free space from their live links.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaAudit {
    pub user_id: Uuid,
    pub space: i64,
    pub free_space: i64,
    /// Sum of sizes over links not yet purged (recycled links included).
    pub referenced: i64,
    /// `space - referenced`, or 0 for unbounded users.
    pub expected_free: i64,
    /// `free_space - expected_free`.
    pub drift: i64,
}

impl QuotaAudit {
    pub fn is_consistent(&self) -> bool {
        self.drift == 0
    }
}

pub struct QuotaController {
    metadata: Arc<dyn MetadataStore>,
}

impl QuotaController {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Refuse `size` more bytes for `user` before any work starts.
    pub fn check(user: &UserRow, size: u64) -> ApiResult<()> {
        let size = to_db_size(size)?;
        if user.has_room_for(size) {
            Ok(())
        } else {
            Err(ApiError::QuotaExceeded(format!(
                "{size} bytes requested, {} free",
                user.free_space
            )))
        }
    }

    /// Load `user_id` and apply [`Self::check`].
    pub async fn check_user(&self, user_id: Uuid, size: u64) -> ApiResult<UserRow> {
        let user = self
            .metadata
            .get_user(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))?;
        Self::check(&user, size)?;
        Ok(user)
    }

    /// Recompute free space from the user's live links.
    pub async fn audit(&self, user_id: Uuid) -> ApiResult<QuotaAudit> {
        let user = self
            .metadata
            .get_user(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))?;
        let referenced = self.metadata.referenced_bytes(user_id).await?;
        // Validates the stored figure is non-negative.
        from_db_size(user.space)?;

        let expected_free = if user.is_quota_bounded() {
            user.space - referenced
        } else {
            0
        };
        let free_space = if user.is_quota_bounded() {
            user.free_space
        } else {
            0
        };
        let audit = QuotaAudit {
            user_id,
            space: user.space,
            free_space,
            referenced,
            expected_free,
            drift: free_space - expected_free,
        };
        if !audit.is_consistent() {
            tracing::warn!(user_id = %user_id, drift = audit.drift, "quota drift detected");
        }
        Ok(audit)
    }
}
