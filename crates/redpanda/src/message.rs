//! Messages delivered to partition claims.

use chrono::{DateTime, Utc};
use rskafka::record::RecordAndOffset;

/// A single record read from a claimed partition.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl ConsumerMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn from_record(topic: &str, partition: i32, record: RecordAndOffset) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset: record.offset,
            key: record.record.key,
            value: record.record.value,
            timestamp: record.record.timestamp,
        }
    }

    /// The message body, or `None` when it is absent or zero-length.
    pub fn payload(&self) -> Option<&[u8]> {
        self.value.as_deref().filter(|value| !value.is_empty())
    }
}
