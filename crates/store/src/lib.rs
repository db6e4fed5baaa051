//! ClickHouse-backed digest and offset storage.

pub mod client;
pub mod config;
pub mod health;
pub mod offsets;
pub mod query;
pub mod schema;
pub mod writer;

pub use client::*;
pub use config::*;
pub use health::{check_connection, init_schema};
pub use offsets::ClickHouseOffsetStorage;
pub use query::*;
pub use writer::ClickHouseStorage;
