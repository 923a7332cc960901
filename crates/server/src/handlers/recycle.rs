//! Recycle bin handlers.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_id, rfc3339};
use crate::recycle::{PurgeReport, PurgeSummary};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use stowage_metadata::models::{RecycledRow, UserFileRow};
use uuid::Uuid;

/// Either a set of files or one directory.
#[derive(Debug, Deserialize)]
pub struct RecycleRequest {
    #[serde(default)]
    pub file_ids: Vec<Uuid>,
    #[serde(default)]
    pub path_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RecycledResponse {
    pub recycled_id: Uuid,
    pub user_file_id: Uuid,
    pub file_id: Uuid,
    pub deleted_at: String,
}

impl From<RecycledRow> for RecycledResponse {
    fn from(row: RecycledRow) -> Self {
        Self {
            recycled_id: row.recycled_id,
            user_file_id: row.user_file_id,
            file_id: row.file_id,
            deleted_at: rfc3339(row.deleted_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RestoredResponse {
    pub user_file_id: Uuid,
    pub file_id: Uuid,
    pub name: String,
    pub path_id: Uuid,
}

impl From<UserFileRow> for RestoredResponse {
    fn from(row: UserFileRow) -> Self {
        Self {
            user_file_id: row.user_file_id,
            file_id: row.file_id,
            name: row.name,
            path_id: row.path_id,
        }
    }
}

/// POST /v1/recycle
pub async fn move_to_recycle(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<RecycleRequest>,
) -> ApiResult<Json<Vec<RecycledResponse>>> {
    let recycled = match (request.path_id, request.file_ids.is_empty()) {
        (Some(path_id), true) => {
            state
                .recycle
                .move_directory_to_recycle(user.user_id, path_id)
                .await?
        }
        (None, false) => {
            state
                .recycle
                .move_to_recycle(user.user_id, &request.file_ids)
                .await?
        }
        _ => {
            return Err(ApiError::BadRequest(
                "give either file_ids or path_id".to_string(),
            ));
        }
    };
    Ok(Json(recycled.into_iter().map(Into::into).collect()))
}

/// GET /v1/recycle
pub async fn list_recycled(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<RecycledResponse>>> {
    let entries = state.recycle.list(user.user_id).await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

/// DELETE /v1/recycle
pub async fn empty_recycle_bin(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<PurgeSummary>> {
    Ok(Json(state.recycle.empty_recycle_bin(user.user_id).await?))
}

/// POST /v1/recycle/{id}/restore
pub async fn restore(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(recycled_id): Path<String>,
) -> ApiResult<Json<RestoredResponse>> {
    let recycled_id = parse_id(&recycled_id, "recycled entry")?;
    let link = state.recycle.restore(user.user_id, recycled_id).await?;
    Ok(Json(link.into()))
}

/// DELETE /v1/recycle/{id}
pub async fn permanently_delete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(recycled_id): Path<String>,
) -> ApiResult<Json<PurgeReport>> {
    let recycled_id = parse_id(&recycled_id, "recycled entry")?;
    Ok(Json(
        state
            .recycle
            .permanently_delete(user.user_id, recycled_id)
            .await?,
    ))
}
