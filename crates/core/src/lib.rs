//! Core types, message parsing, and the storage port for the digest writer.

pub mod error;
pub mod message;
pub mod shutdown;
pub mod storage;

pub use error::{Error, Result};
pub use message::*;
pub use shutdown::*;
pub use storage::*;
