//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers::{downloads, files, health, packages, recycle, shares, uploads, users};
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

/// Slack on top of the configured chunk size for chunk bodies.
const CHUNK_BODY_BUFFER: u64 = 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let chunk_limit = usize::try_from(state.config.upload.chunk_size.saturating_add(CHUNK_BODY_BUFFER))
        .unwrap_or(usize::MAX);

    let api_routes = Router::new()
        // Health check (unauthenticated for load balancers and probes)
        .route("/v1/health", get(health::health_check))
        // Uploads
        .route("/v1/uploads/precheck", post(uploads::precheck))
        .route(
            "/v1/uploads/{upload_id}",
            get(uploads::upload_status).delete(uploads::abort_upload),
        )
        .route(
            "/v1/uploads/{upload_id}/chunks/{index}",
            put(uploads::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route(
            "/v1/uploads/{upload_id}/finalize",
            post(uploads::finalize_upload),
        )
        .route("/v1/uploads/{upload_id}/renew", post(uploads::renew_upload))
        // Reads
        .route("/v1/files/{file_id}/content", get(files::file_content))
        .route(
            "/v1/files/{file_id}/play-token",
            post(files::create_play_token),
        )
        // Offline downloads
        .route(
            "/v1/downloads",
            post(downloads::submit_download).get(downloads::list_downloads),
        )
        .route("/v1/downloads/{task_id}", get(downloads::get_download))
        .route(
            "/v1/downloads/{task_id}/{action}",
            post(downloads::control_download),
        )
        // Recycle bin
        .route(
            "/v1/recycle",
            post(recycle::move_to_recycle)
                .get(recycle::list_recycled)
                .delete(recycle::empty_recycle_bin),
        )
        .route(
            "/v1/recycle/{recycled_id}/restore",
            post(recycle::restore),
        )
        .route(
            "/v1/recycle/{recycled_id}",
            delete(recycle::permanently_delete),
        )
        // Shares
        .route(
            "/v1/shares",
            post(shares::create_share).get(shares::list_shares),
        )
        .route("/v1/shares/{share}", delete(shares::revoke_share))
        .route("/v1/shares/{share}/content", get(shares::shared_content))
        // Packages
        .route("/v1/packages", post(packages::start_package))
        .route("/v1/packages/{package_id}", get(packages::package_progress))
        .route(
            "/v1/packages/{package_id}/archive",
            get(packages::package_archive),
        )
        // Account
        .route("/v1/users/me", get(users::me))
        .route("/v1/users/me/passphrase", put(users::set_passphrase));

    let mut router = Router::new().merge(api_routes);

    // When enabled, this endpoint must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
