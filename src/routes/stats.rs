use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::routes::error::ApiResult;
use crate::services::queue::QueueStats;

/// GET /api/v1/stats: Work queue, dead-letter and status backlog counters.
pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    let stats = state.queue.stats().await?;
    metrics::gauge!("work_queue_depth").set(stats.queued as f64);
    Ok(Json(stats))
}
