//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/health", get(handlers::health_check))
        // Chunked uploads
        .route("/api/upload/init", post(handlers::init_upload))
        .route("/api/upload/chunk", post(handlers::upload_chunk))
        .route("/api/upload/complete", post(handlers::complete_upload))
        .route("/api/upload/{upload_id}", get(handlers::get_upload))
        // Single-shot upload
        .route("/api/upload", post(handlers::upload_file))
        // Retrieval
        .route("/api/download/{code}", get(handlers::get_download_info))
        .route("/api/file/{code}", get(handlers::get_file))
        .route("/api/group", post(handlers::create_group))
        .route("/api/group/{code}", get(handlers::get_group));

    let mut router = Router::new().merge(api_routes);

    // When enabled, /metrics should be reachable only by the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(DefaultBodyLimit::max(state.config.server.body_limit()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
