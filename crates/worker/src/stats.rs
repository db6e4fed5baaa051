//! Per-consumer outcome tallies.

use serde::Serialize;
use telemetry::Counter;

/// Success and error counts of one consumer instance.
///
/// Incremented concurrently from every claim loop.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    successes: Counter,
    errors: Counter,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub errors: u64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.successes.inc();
    }

    pub fn record_error(&self) {
        self.errors.inc();
    }

    pub fn successes(&self) -> u64 {
        self.successes.get()
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.successes(),
            errors: self.errors(),
        }
    }
}
