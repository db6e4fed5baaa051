//! Consumer-group session protocol.
//!
//! One call to [`ConsumerGroup::consume`] is one generation:
//!
//! 1. join the group and receive a partition assignment
//! 2. [`ConsumerGroupHandler::setup`]
//! 3. one [`ConsumerGroupHandler::consume_claim`] task per partition
//! 4. wait until every claim loop has returned
//! 5. [`ConsumerGroupHandler::cleanup`]
//!
//! A generation ends when the caller's token is cancelled, the group is
//! closed, or the assignment changes. Offsets marked on the session are
//! the resume points for the next generation.

use async_trait::async_trait;
use digest_core::{CancelToken, CancellationSource, CommittedOffset, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::message::ConsumerMessage;

/// Callbacks invoked by a [`ConsumerGroup`] for every generation.
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    /// Runs once the assignment is known, before any claim loop starts.
    async fn setup(&self, session: &GroupSession) -> Result<()>;

    /// Runs after every claim loop of the generation has returned.
    async fn cleanup(&self, session: &GroupSession) -> Result<()>;

    /// Consumes one partition until the session ends or the claim is drained.
    async fn consume_claim(&self, session: &GroupSession, claim: PartitionClaim) -> Result<()>;
}

/// A broker-coordinated group of consumers.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Joins the group and drives `handler` for a single generation.
    ///
    /// Returns `Ok` when the generation ended normally (cancellation or
    /// rebalance) and `Err` when the session could not be established or
    /// broke down.
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancelToken,
    ) -> Result<()>;

    /// Leaves the group and releases broker resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Committed resume points, keyed by topic and partition.
///
/// Also remembers which points already reached durable storage, so a
/// flush only carries what changed since the last one.
#[derive(Debug, Default)]
pub struct OffsetStore {
    offsets: Mutex<HashMap<(String, i32), i64>>,
    flushed: Mutex<HashMap<(String, i32), i64>>,
}

impl OffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `next_offset` as the resume point. Never moves backwards.
    pub fn mark(&self, topic: &str, partition: i32, next_offset: i64) -> bool {
        let mut offsets = self.offsets.lock();
        let entry = offsets
            .entry((topic.to_string(), partition))
            .or_insert(next_offset);
        if next_offset > *entry {
            *entry = next_offset;
        }
        *entry == next_offset
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Seeds resume points loaded from durable storage.
    pub fn restore(&self, topic: &str, committed: &[CommittedOffset]) {
        let mut offsets = self.offsets.lock();
        let mut flushed = self.flushed.lock();
        for entry in committed {
            let key = (topic.to_string(), entry.partition);
            let current = offsets.entry(key.clone()).or_insert(entry.next_offset);
            *current = (*current).max(entry.next_offset);
            flushed.insert(key, entry.next_offset);
        }
    }

    /// Drops the resume point of a partition so the reset policy applies again.
    pub fn forget(&self, topic: &str, partition: i32) -> Option<i64> {
        let key = (topic.to_string(), partition);
        self.flushed.lock().remove(&key);
        self.offsets.lock().remove(&key)
    }

    /// Resume points of `topic` that changed since they were last flushed.
    pub fn pending(&self, topic: &str) -> Vec<CommittedOffset> {
        let offsets = self.offsets.lock();
        let flushed = self.flushed.lock();
        let mut pending: Vec<_> = offsets
            .iter()
            .filter(|((t, partition), offset)| {
                t == topic && flushed.get(&(t.clone(), *partition)) != Some(*offset)
            })
            .map(|((_, partition), &offset)| CommittedOffset::new(*partition, offset))
            .collect();
        pending.sort_by_key(|entry| entry.partition);
        pending
    }

    /// Records that `committed` reached durable storage.
    pub fn confirm(&self, topic: &str, committed: &[CommittedOffset]) {
        let mut flushed = self.flushed.lock();
        for entry in committed {
            flushed.insert((topic.to_string(), entry.partition), entry.next_offset);
        }
    }
}

/// One generation of group membership.
#[derive(Debug)]
pub struct GroupSession {
    generation_id: u64,
    member_id: String,
    topic: String,
    claims: Vec<i32>,
    offsets: Arc<OffsetStore>,
    token: CancelToken,
}

impl GroupSession {
    pub fn new(
        generation_id: u64,
        member_id: impl Into<String>,
        topic: impl Into<String>,
        claims: Vec<i32>,
        offsets: Arc<OffsetStore>,
        token: CancelToken,
    ) -> Self {
        Self {
            generation_id,
            member_id: member_id.into(),
            topic: topic.into(),
            claims,
            offsets,
            token,
        }
    }

    pub fn generation_id(&self) -> u64 {
        self.generation_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partitions assigned to this member for the generation.
    pub fn claims(&self) -> &[i32] {
        &self.claims
    }

    /// Acknowledges `message`; the partition resumes after it next generation.
    pub fn mark_message(&self, message: &ConsumerMessage) {
        self.offsets
            .mark(&message.topic, message.partition, message.offset + 1);
    }

    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.offsets.get(&self.topic, partition)
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the generation is over.
    pub async fn done(&self) {
        self.token.cancelled().await
    }
}

/// The right to read one partition for the current generation.
#[derive(Debug)]
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    messages: mpsc::Receiver<ConsumerMessage>,
}

impl PartitionClaim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        messages: mpsc::Receiver<ConsumerMessage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset the claim started reading from.
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Next message in offset order, or `None` once the feed has stopped.
    pub async fn next_message(&mut self) -> Option<ConsumerMessage> {
        self.messages.recv().await
    }
}

/// Runs setup, the claim loops and cleanup for one generation.
///
/// A claim loop that fails ends the whole generation so the group can
/// rejoin with a fresh assignment. A member with nothing assigned holds its
/// empty generation until it is cancelled.
pub(crate) async fn run_generation(
    handler: Arc<dyn ConsumerGroupHandler>,
    session: Arc<GroupSession>,
    claims: Vec<PartitionClaim>,
    session_source: &CancellationSource,
) -> Result<()> {
    if let Err(e) = handler.setup(&session).await {
        session_source.cancel();
        return Err(e);
    }

    if claims.is_empty() {
        debug!(generation = session.generation_id(), "No partitions claimed");
        session.done().await;
    }

    let mut tasks = JoinSet::new();
    for claim in claims {
        let handler = handler.clone();
        let session = session.clone();
        let source = session_source.clone();
        tasks.spawn(async move {
            let partition = claim.partition();
            if let Err(e) = handler.consume_claim(&session, claim).await {
                error!(partition = partition, error = %e, "Claim loop failed, ending session");
                source.cancel();
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Claim task aborted");
            session_source.cancel();
        }
    }

    debug!(generation = session.generation_id(), "All claim loops finished");
    handler.cleanup(&session).await
}
