//! Offline download handlers.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_id, rfc3339};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use stowage_core::download::DownloadControl;
use stowage_metadata::models::DownloadTaskRow;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SubmitDownloadRequest {
    /// HTTP(S) URL, magnet link or torrent URL.
    pub source: String,
    #[serde(default = "root_path")]
    pub virtual_path: String,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct ControlRequest {
    /// Needed to resume an encrypting task after a restart.
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadTaskResponse {
    pub task_id: Uuid,
    pub kind: String,
    pub source: String,
    pub virtual_path: String,
    pub encrypt: bool,
    pub state: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub downloaded_bytes: i64,
    pub progress: f64,
    pub speed: i64,
    pub supports_range: bool,
    pub file_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<DownloadTaskRow> for DownloadTaskResponse {
    fn from(row: DownloadTaskRow) -> Self {
        Self {
            task_id: row.task_id,
            kind: row.kind,
            source: row.source,
            virtual_path: row.virtual_path,
            encrypt: row.encrypt,
            state: row.state,
            file_name: row.file_name,
            file_size: row.file_size,
            downloaded_bytes: row.downloaded_bytes,
            progress: row.progress,
            speed: row.speed,
            supports_range: row.supports_range,
            file_id: row.file_id,
            error: row.error,
            created_at: rfc3339(row.created_at),
            updated_at: rfc3339(row.updated_at),
        }
    }
}

/// POST /v1/downloads
pub async fn submit_download(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<SubmitDownloadRequest>,
) -> ApiResult<(StatusCode, Json<DownloadTaskResponse>)> {
    let task = state
        .downloads
        .submit(
            user.user_id,
            &request.source,
            &request.virtual_path,
            request.encrypt,
            request.passphrase.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(task.into())))
}

/// GET /v1/downloads
pub async fn list_downloads(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<DownloadTaskResponse>>> {
    let tasks = state.downloads.list(user.user_id).await?;
    Ok(Json(tasks.into_iter().map(Into::into).collect()))
}

/// GET /v1/downloads/{id}
pub async fn get_download(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<String>,
) -> ApiResult<Json<DownloadTaskResponse>> {
    let task = state
        .downloads
        .get(user.user_id, parse_id(&task_id, "download")?)
        .await?;
    Ok(Json(task.into()))
}

/// POST /v1/downloads/{id}/{action}
///
/// `action` is one of `pause`, `resume`, `cancel` or `delete`.
pub async fn control_download(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((task_id, action)): Path<(String, String)>,
    request: Option<Json<ControlRequest>>,
) -> ApiResult<Json<DownloadTaskResponse>> {
    let task_id = parse_id(&task_id, "download")?;
    let control = DownloadControl::parse(&action)
        .map_err(|_| ApiError::BadRequest(format!("unknown download action {action:?}")))?;
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let task = state
        .downloads
        .control(user.user_id, task_id, control, request.passphrase.as_deref())
        .await?;
    Ok(Json(task.into()))
}
