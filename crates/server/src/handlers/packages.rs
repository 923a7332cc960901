//! Multi-file package handlers.

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::handlers::common::parse_id;
use crate::packaging::PackageProgress;
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use stowage_storage::remove_tree;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PackageRequest {
    pub file_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PackageStarted {
    pub package_id: Uuid,
}

/// POST /v1/packages
pub async fn start_package(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<PackageRequest>,
) -> ApiResult<(StatusCode, Json<PackageStarted>)> {
    let package_id = state.packages.start(user.user_id, &request.file_ids).await?;
    Ok((StatusCode::ACCEPTED, Json(PackageStarted { package_id })))
}

/// GET /v1/packages/{id}
pub async fn package_progress(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(package_id): Path<String>,
) -> ApiResult<Json<PackageProgress>> {
    let progress = state
        .packages
        .progress(user.user_id, parse_id(&package_id, "package")?)?;
    Ok(Json(progress))
}

/// GET /v1/packages/{id}/archive
///
/// Hands the archive over once; the scratch directory is removed as soon as
/// the file is open.
pub async fn package_archive(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(package_id): Path<String>,
) -> ApiResult<Response> {
    let package_id = parse_id(&package_id, "package")?;
    let archive = state.packages.take(user.user_id, package_id)?;
    let file = tokio::fs::File::open(&archive.path).await?;
    let size = file.metadata().await?.len();
    if let Err(e) = remove_tree(&archive.dir).await {
        tracing::warn!(package_id = %package_id, error = %e, "failed to remove package scratch");
    }

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/x-tar".to_string()),
            (CONTENT_LENGTH, size.to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"package-{}.tar\"", package_id.simple()),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
