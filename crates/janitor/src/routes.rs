//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::JanitorState;
use axum::Router;
use axum::routing::get;

/// Create the janitor router.
pub fn create_router(state: JanitorState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/jobs", get(handlers::list_jobs))
        // Prometheus scrape endpoint, outside any auth
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
