//! Redpanda consumer-group sessions for the digest writer.
//!
//! [`ConsumerGroup`] is the broker-side contract the session controller
//! drives. [`RedpandaGroup`] implements it on top of rskafka;
//! [`MemoryGroup`] implements it in-process for tests and local runs.

pub mod client;
pub mod config;
pub mod group;
pub mod health;
pub mod memory;
pub mod message;

pub use client::RedpandaGroup;
pub use config::*;
pub use group::*;
pub use memory::MemoryGroup;
pub use message::ConsumerMessage;
