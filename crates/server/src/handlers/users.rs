//! Account handlers for the acting user.

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub username: String,
    /// 0 means unlimited.
    pub space: i64,
    pub free_space: i64,
    pub has_file_passphrase: bool,
}

/// GET /v1/users/me
pub async fn me(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResult<Json<MeResponse>> {
    let row = state.users.get(user.user_id).await?;
    Ok(Json(MeResponse {
        user_id: row.user_id,
        username: row.username,
        space: row.space,
        free_space: row.free_space,
        has_file_passphrase: row.file_passphrase_hash.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PassphraseRequest {
    pub passphrase: String,
}

/// PUT /v1/users/me/passphrase
pub async fn set_passphrase(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<PassphraseRequest>,
) -> ApiResult<StatusCode> {
    state
        .users
        .set_file_passphrase(user.user_id, &request.passphrase)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
