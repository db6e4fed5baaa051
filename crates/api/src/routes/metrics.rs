//! Metrics endpoint.

use axum::{extract::State, Json};
use telemetry::metrics;

use crate::response::MetricsResponse;
use crate::state::AppState;

/// GET /metrics - JSON snapshot of consumer and pipeline counters.
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse::new(
        state.consumer.stats().snapshot(),
        metrics().snapshot(),
    ))
}
