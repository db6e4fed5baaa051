//! Consumer pipeline for the digest writer.
//!
//! - Handler (parse → extract → persist, one message at a time)
//! - Session (state machine, per-generation readiness, join backoff)
//! - Consumer (serve/close lifecycle over a consumer group)

pub mod consumer;
pub mod handler;
pub mod session;
pub mod stats;

pub use consumer::*;
pub use handler::MessageHandler;
pub use session::*;
pub use stats::{ConsumerStats, StatsSnapshot};
