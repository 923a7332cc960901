//! Health check.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub disks: usize,
}

/// GET /v1/health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        disks: state.disks.disks().len(),
    }))
}
