//! Application state shared across handlers.

use std::sync::Arc;
use worker::KafkaConsumer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The consumer whose session the probes report on
    pub consumer: Arc<KafkaConsumer>,
}

impl AppState {
    pub fn new(consumer: Arc<KafkaConsumer>) -> Self {
        Self { consumer }
    }
}
