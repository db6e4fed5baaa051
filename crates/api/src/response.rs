//! Probe response bodies.

use serde::{Deserialize, Serialize};
use telemetry::{ComponentHealthReport, MetricsSnapshot};
use worker::{SessionState, StatsSnapshot};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub session: SessionState,
    pub broker_connected: bool,
    pub storage_connected: bool,
    pub components: Vec<ComponentHealthReport>,
}

/// Metrics response: this consumer's tallies plus the pipeline metrics.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: i64,
    pub consumer: StatsSnapshot,
    pub pipeline: MetricsSnapshot,
}

impl MetricsResponse {
    pub fn new(consumer: StatsSnapshot, pipeline: MetricsSnapshot) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            consumer,
            pipeline,
        }
    }
}

/// Body of a failed probe.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub status: String,
    pub reason: String,
}

impl ProbeFailure {
    pub fn new(status: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            reason: reason.into(),
        }
    }
}
