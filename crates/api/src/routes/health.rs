//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use telemetry::health;

use crate::response::{HealthResponse, ProbeFailure};
use crate::state::AppState;

/// GET /health - Full health check.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = health().report();

    Json(HealthResponse {
        status: format!("{:?}", report.status).to_lowercase(),
        session: state.consumer.state(),
        broker_connected: health().broker.is_healthy(),
        storage_connected: health().storage.is_healthy(),
        components: report.components,
    })
}

/// GET /health/ready - Partitions are assigned and being consumed.
pub async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.consumer.is_ready() {
        StatusCode::OK.into_response()
    } else {
        let session = state.consumer.state();
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeFailure::new(session.as_str(), "consumer group session is not ready")),
        )
            .into_response()
    }
}

/// GET /health/live - Liveness probe (process is up).
pub async fn live_handler() -> StatusCode {
    StatusCode::OK
}
