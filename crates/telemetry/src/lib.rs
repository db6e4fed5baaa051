//! Telemetry for the digest writer.
//!
//! Counters and health are kept in-process; they are exposed through the
//! HTTP probes and logged, never pushed to an external system.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
