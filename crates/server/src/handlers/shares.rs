//! Share link handlers.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{header_str, parse_id, range_header, range_response, rfc3339};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use stowage_metadata::models::ShareRow;
use uuid::Uuid;

/// Header carrying the share password, when the share has one.
pub const SHARE_PASSWORD_HEADER: &str = "x-share-password";

#[derive(Debug, Deserialize)]
pub struct CreateShareRequest {
    pub file_id: Uuid,
    /// Lifetime in seconds; omitted means no expiry.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ShareResponse {
    pub share_id: Uuid,
    pub file_id: Uuid,
    pub token: String,
    pub has_password: bool,
    pub expires_at: Option<String>,
    pub download_count: i64,
    pub created_at: String,
}

impl From<ShareRow> for ShareResponse {
    fn from(row: ShareRow) -> Self {
        Self {
            share_id: row.share_id,
            file_id: row.file_id,
            token: row.token,
            has_password: !row.password_hash.is_empty(),
            expires_at: row.expires_at.map(rfc3339),
            download_count: row.download_count,
            created_at: rfc3339(row.created_at),
        }
    }
}

/// POST /v1/shares
pub async fn create_share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateShareRequest>,
) -> ApiResult<(StatusCode, Json<ShareResponse>)> {
    let share = state
        .shares
        .create(
            user.user_id,
            request.file_id,
            request.ttl_secs.map(time::Duration::seconds),
            request.password.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(share.into())))
}

/// GET /v1/shares
pub async fn list_shares(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<ShareResponse>>> {
    let shares = state.shares.list(user.user_id).await?;
    Ok(Json(shares.into_iter().map(Into::into).collect()))
}

/// DELETE /v1/shares/{id}
pub async fn revoke_share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(share_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .shares
        .revoke(user.user_id, parse_id(&share_id, "share")?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/shares/{token}/content
///
/// Needs no user; the token and optional password are the credentials.
pub async fn shared_content(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if token.is_empty() {
        return Err(ApiError::NotFound("share".to_string()));
    }
    let password = header_str(&headers, SHARE_PASSWORD_HEADER)?;
    let share = state.shares.resolve(&token, password).await?;
    let reply = state
        .reader
        .open_shared_range(&share, range_header(&headers)?)
        .await?;
    Ok(range_response(reply))
}
