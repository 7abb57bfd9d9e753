use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod error;
pub mod health;
pub mod metrics;
pub mod projects;
pub mod stats;

/// API router with the scrape endpoint mounted on its own state.
pub fn router(state: AppState, metrics_state: metrics::MetricsState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route("/api/v1/projects/{id}", get(projects::get_project))
        .route("/api/v1/projects/{id}/download", get(projects::download_model))
        .route("/api/v1/stats", get(stats::queue_stats))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}
