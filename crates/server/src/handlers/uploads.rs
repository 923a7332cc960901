//! Upload control plane handlers.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{header_str, parse_id};
use crate::state::AppState;
use crate::upload::StoredFile;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use stowage_core::UploadTaskId;
use stowage_core::upload::{FinalizeOptions, PrecheckOutcome, PrecheckRequest, UploadProgress};

/// Header carrying the total chunk count of the upload.
pub const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";
/// Header carrying the hex MD5 of the chunk body.
pub const CONTENT_MD5_HEADER: &str = "content-md5";

fn task_id(raw: &str) -> ApiResult<UploadTaskId> {
    Ok(UploadTaskId::from_uuid(parse_id(raw, "upload")?))
}

/// POST /v1/uploads/precheck
pub async fn precheck(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<PrecheckRequest>,
) -> ApiResult<Json<PrecheckOutcome>> {
    let outcome = state.uploads.precheck(user.user_id, request).await?;
    Ok(Json(outcome))
}

/// GET /v1/uploads/{id}
pub async fn upload_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadProgress>> {
    let progress = state.uploads.status(user.user_id, task_id(&upload_id)?).await?;
    Ok(Json(progress))
}

/// DELETE /v1/uploads/{id}
pub async fn abort_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.uploads.abort(user.user_id, task_id(&upload_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /v1/uploads/{id}/chunks/{index}
pub async fn upload_chunk(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((upload_id, index)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<UploadProgress>> {
    let id = task_id(&upload_id)?;
    let index: u32 = index
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid chunk index {index:?}")))?;
    let total: u32 = header_str(&headers, TOTAL_CHUNKS_HEADER)?
        .ok_or_else(|| ApiError::BadRequest(format!("missing {TOTAL_CHUNKS_HEADER} header")))?
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {TOTAL_CHUNKS_HEADER} header")))?;
    let md5 = header_str(&headers, CONTENT_MD5_HEADER)?
        .ok_or_else(|| ApiError::BadRequest(format!("missing {CONTENT_MD5_HEADER} header")))?
        .trim()
        .to_ascii_lowercase();

    let progress = state
        .uploads
        .receive_chunk(user.user_id, id, index, total, &md5, body)
        .await?;
    Ok(Json(progress))
}

/// POST /v1/uploads/{id}/finalize
pub async fn finalize_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
    options: Option<Json<FinalizeOptions>>,
) -> ApiResult<(StatusCode, Json<StoredFile>)> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let stored = state
        .uploads
        .finalize(user.user_id, task_id(&upload_id)?, options)
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// POST /v1/uploads/{id}/renew
pub async fn renew_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadProgress>> {
    let progress = state.uploads.renew(user.user_id, task_id(&upload_id)?).await?;
    Ok(Json(progress))
}
