//! File content and play tokens.

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::handlers::common::{header_str, parse_id, range_header, range_response};
use crate::reader::PlayToken;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;

/// Header alternative to the `token` query parameter.
pub const PLAY_TOKEN_HEADER: &str = "x-play-token";

#[derive(Debug, Default, Deserialize)]
pub struct ContentQuery {
    /// Play token for encrypted files.
    pub token: Option<String>,
}

/// GET /v1/files/{id}/content
///
/// Honors a single `Range`. Encrypted files need a play token, as `X-Play-Token`
/// or `?token=`.
pub async fn file_content(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<String>,
    Query(query): Query<ContentQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let file_id = parse_id(&file_id, "file")?;
    let token = match header_str(&headers, PLAY_TOKEN_HEADER)? {
        Some(token) => Some(token),
        None => query.token.as_deref(),
    };
    let reply = state
        .reader
        .open_range(user.user_id, file_id, range_header(&headers)?, token)
        .await?;
    Ok(range_response(reply))
}

#[derive(Debug, Deserialize)]
pub struct PlayTokenRequest {
    pub passphrase: String,
}

/// POST /v1/files/{id}/play-token
pub async fn create_play_token(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<String>,
    Json(request): Json<PlayTokenRequest>,
) -> ApiResult<Json<PlayToken>> {
    let file_id = parse_id(&file_id, "file")?;
    let token = state
        .reader
        .create_play_token(user.user_id, file_id, &request.passphrase)
        .await?;
    Ok(Json(token))
}
