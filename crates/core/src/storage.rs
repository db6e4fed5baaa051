//! Storage ports for extracted digests and committed offsets.

use async_trait::async_trait;

use crate::error::Result;

/// Write side of the digest store.
///
/// Called concurrently from every claimed partition. Writing the same set
/// of digests twice must leave the store in the same state as writing it
/// once, since messages can be redelivered across generations.
#[async_trait]
pub trait DigestStorage: Send + Sync {
    async fn write_digests(&self, digests: &[String]) -> Result<()>;
}

/// Resume point of one partition: the offset of the next message to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedOffset {
    pub partition: i32,
    pub next_offset: i64,
}

impl CommittedOffset {
    pub fn new(partition: i32, next_offset: i64) -> Self {
        Self {
            partition,
            next_offset,
        }
    }
}

/// Durable home of a consumer group's committed offsets.
///
/// Offsets are keyed by group and topic, so every process sharing a group id
/// resumes from the same points after a restart.
#[async_trait]
pub trait OffsetStorage: Send + Sync {
    /// Last committed resume point of every partition that has one.
    async fn load_offsets(&self, group_id: &str, topic: &str) -> Result<Vec<CommittedOffset>>;

    async fn commit_offsets(
        &self,
        group_id: &str,
        topic: &str,
        offsets: &[CommittedOffset],
    ) -> Result<()>;
}
