//! In-process consumer group.
//!
//! Holds one append-only log per partition and behaves like a single-member
//! group: every generation claims every partition, resuming from the
//! offsets marked in earlier generations. Rebalances and join failures can
//! be triggered on demand.

use async_trait::async_trait;
use digest_core::{CancelToken, CancellationSource, Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::group::{
    run_generation, ConsumerGroup, ConsumerGroupHandler, GroupSession, OffsetStore, PartitionClaim,
};
use crate::message::ConsumerMessage;

const MEMORY_BUFFER_SIZE: usize = 16;

#[derive(Debug, Default)]
struct MemoryLog {
    partitions: Mutex<BTreeMap<i32, Vec<Option<Vec<u8>>>>>,
    appended: Notify,
}

impl MemoryLog {
    fn record(&self, partition: i32, offset: i64) -> Option<Option<Vec<u8>>> {
        let index = usize::try_from(offset).ok()?;
        self.partitions
            .lock()
            .get(&partition)
            .and_then(|log| log.get(index).cloned())
    }
}

/// Single-member consumer group backed by in-memory partition logs.
pub struct MemoryGroup {
    topic: String,
    log: Arc<MemoryLog>,
    offsets: Arc<OffsetStore>,
    generation: AtomicU64,
    active: Mutex<Option<CancellationSource>>,
    failing_joins: AtomicU32,
    joins: AtomicU32,
    closing: CancellationSource,
    closed: AtomicBool,
}

impl MemoryGroup {
    /// Creates a group for `topic` with `partitions` empty partitions.
    pub fn new(topic: impl Into<String>, partitions: i32) -> Self {
        let log = MemoryLog::default();
        {
            let mut logs = log.partitions.lock();
            for partition in 0..partitions.max(1) {
                logs.insert(partition, Vec::new());
            }
        }

        Self {
            topic: topic.into(),
            log: Arc::new(log),
            offsets: Arc::new(OffsetStore::new()),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            failing_joins: AtomicU32::new(0),
            joins: AtomicU32::new(0),
            closing: CancellationSource::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a record and returns its offset.
    pub fn produce(&self, partition: i32, value: Option<Vec<u8>>) -> Result<i64> {
        let offset = {
            let mut logs = self.log.partitions.lock();
            let log = logs
                .get_mut(&partition)
                .ok_or_else(|| Error::broker(format!("unknown partition {}", partition)))?;
            log.push(value);
            (log.len() - 1) as i64
        };
        self.log.appended.notify_waiters();
        Ok(offset)
    }

    /// Ends the current generation as if the broker reassigned partitions.
    pub fn rebalance(&self) {
        if let Some(source) = self.active.lock().as_ref() {
            info!("Forcing rebalance of in-memory group");
            source.cancel();
        }
    }

    /// Makes the next `count` join attempts fail.
    pub fn fail_next_joins(&self, count: u32) {
        self.failing_joins.store(count, Ordering::SeqCst);
    }

    /// Resume point of a partition, if any message there was acknowledged.
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.offsets.get(&self.topic, partition)
    }

    /// Number of generations that completed a join.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of join attempts, failed ones included.
    pub fn join_attempts(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn partitions(&self) -> Vec<i32> {
        self.log.partitions.lock().keys().copied().collect()
    }

    fn take_join_failure(&self) -> bool {
        self.failing_joins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Feeds one partition log into its claim channel.
async fn feed_partition(
    log: Arc<MemoryLog>,
    topic: String,
    partition: i32,
    mut offset: i64,
    tx: mpsc::Sender<ConsumerMessage>,
    token: CancelToken,
) {
    loop {
        let appended = log.appended.notified();
        match log.record(partition, offset) {
            Some(value) => {
                let message = ConsumerMessage::new(topic.as_str(), partition, offset, value);
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                offset += 1;
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = appended => {}
                }
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancelToken,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::GroupClosed);
        }
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.take_join_failure() {
            return Err(Error::broker("injected join failure"));
        }
        if topic != self.topic {
            return Err(Error::broker(format!("unknown topic '{}'", topic)));
        }

        let session_source = CancellationSource::child_of(&cancel);
        session_source.cancel_on(self.closing.token());
        *self.active.lock() = Some(session_source.clone());

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let assignment = self.partitions();

        let mut feeders = JoinSet::new();
        let mut claims = Vec::with_capacity(assignment.len());
        for &partition in &assignment {
            let offset = self.offsets.get(topic, partition).unwrap_or(0);
            let (tx, rx) = mpsc::channel(MEMORY_BUFFER_SIZE);
            claims.push(PartitionClaim::new(topic, partition, offset, rx));
            feeders.spawn(feed_partition(
                self.log.clone(),
                topic.to_string(),
                partition,
                offset,
                tx,
                session_source.token(),
            ));
        }

        let session = Arc::new(GroupSession::new(
            generation,
            "memory-member",
            topic,
            assignment,
            self.offsets.clone(),
            session_source.token(),
        ));

        debug!(generation = generation, "In-memory generation started");
        let result = run_generation(handler, session, claims, &session_source).await;
        session_source.cancel();
        while feeders.join_next().await.is_some() {}
        self.active.lock().take();

        result
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closing.cancel();
        Ok(())
    }
}
