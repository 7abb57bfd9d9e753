use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::JobQueue;

/// State of the scrape endpoint, separate from the API state.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<JobQueue>,
}

/// Prometheus metrics scrape endpoint.
/// Refreshes the queue depth gauge, then renders the text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    if let Ok(depth) = state.queue.queue_depth().await {
        metrics::gauge!("work_queue_depth").set(depth as f64);
    }
    state.handle.render()
}
