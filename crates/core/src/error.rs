//! Unified error types for the digest writer.
//!
//! Errors fall into four groups:
//! - Poison messages: `Decode`, `Validation` (skipped, never retried)
//! - Downstream: `Storage`
//! - Session: `Broker`, `GroupClosed`, `JoinFailed`
//! - Startup: `Config`

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the digest writer.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload is not valid JSON for the expected shape.
    #[error("{0}")]
    Decode(#[from] serde_json::Error),

    /// Payload decoded but violates a required-field rule.
    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("consumer group is closed")]
    GroupClosed,

    #[error("unable to join consumer group after {attempts} attempts: {last_error}")]
    JoinFailed { attempts: u32, last_error: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error was caused by the message payload itself.
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Validation(_))
    }

    /// Short, stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Broker(_) => "broker",
            Self::GroupClosed => "group_closed",
            Self::JoinFailed { .. } => "join_failed",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}
