//! Group permission checks.

use crate::error::{ApiError, ApiResult};
use std::collections::HashSet;
use stowage_core::Permission;
use stowage_metadata::MetadataStore;
use stowage_metadata::repos::UserRepo;
use uuid::Uuid;

/// Permissions granted to `user_id` through their group.
///
/// Characteristics this build does not know are skipped.
pub async fn effective(metadata: &dyn MetadataStore, user_id: Uuid) -> ApiResult<HashSet<Permission>> {
    let raw = metadata.effective_permissions(user_id).await?;
    let mut granted = HashSet::with_capacity(raw.len());
    for characteristic in raw {
        match Permission::parse(&characteristic) {
            Ok(permission) => {
                granted.insert(permission);
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, characteristic = %characteristic, "ignoring unknown permission");
            }
        }
    }
    Ok(granted)
}

/// Fail `Forbidden` unless `user_id` holds `permission`.
pub async fn require(
    metadata: &dyn MetadataStore,
    user_id: Uuid,
    permission: Permission,
) -> ApiResult<()> {
    if effective(metadata, user_id).await?.contains(&permission) {
        Ok(())
    } else {
        tracing::debug!(user_id = %user_id, permission = permission.as_str(), "permission denied");
        Err(ApiError::Forbidden(format!(
            "missing permission {}",
            permission.as_str()
        )))
    }
}
