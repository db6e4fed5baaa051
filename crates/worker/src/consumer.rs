//! Consumer worker: drives consumer-group sessions and feeds the handler.
//!
//! The worker implements the session loop:
//! 1. Join the group (one generation per join)
//! 2. Signal readiness once partitions are assigned
//! 3. Handle every claimed message in offset order, then mark it
//! 4. Rejoin after a rebalance, back off after a failed join
//!
//! Offsets are marked after the handler returns, whatever the outcome, so
//! poison messages and storage failures are skipped rather than retried.

use async_trait::async_trait;
use digest_core::{CancellationSource, DigestStorage, Error, OffsetStorage, Result};
use redpanda::{
    ConsumerGroup, ConsumerGroupHandler, ConsumerMessage, GroupSession, PartitionClaim,
    RedpandaConfig, RedpandaGroup,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telemetry::{health, metrics};
use tracing::{debug, error, info, warn};

use crate::handler::MessageHandler;
use crate::session::{JoinBackoff, Readiness, SessionState, SessionStateCell};
use crate::stats::ConsumerStats;

/// Process-facing consumer contract.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Consumes until the consumer is closed. Returns once.
    async fn serve(&self) -> Result<()>;

    /// Stops consuming and releases broker resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Runs the handler pipeline on a single message.
    async fn process_message(&self, message: &ConsumerMessage) -> Result<()>;

    fn number_of_successfully_consumed_messages(&self) -> u64;

    fn number_of_errors_consuming_messages(&self) -> u64;
}

/// Consumer backed by a [`ConsumerGroup`].
pub struct KafkaConsumer {
    topic: String,
    group: Arc<dyn ConsumerGroup>,
    handler: Arc<MessageHandler>,
    backoff: JoinBackoff,
    state: Arc<SessionStateCell>,
    readiness: Arc<Readiness>,
    cancel: CancellationSource,
    serving: AtomicBool,
    served: AtomicBool,
    closed: AtomicBool,
}

impl KafkaConsumer {
    /// Connects to the brokers in `config`. Failure here is fatal.
    pub async fn connect(
        config: RedpandaConfig,
        storage: Arc<dyn DigestStorage>,
        offsets: Arc<dyn OffsetStorage>,
    ) -> Result<Self> {
        let topic = config.topic.clone();
        let group = RedpandaGroup::connect(config, offsets).await?;
        Ok(Self::with_group(topic, Arc::new(group), storage))
    }

    /// Creates a consumer over an existing group.
    pub fn with_group(
        topic: impl Into<String>,
        group: Arc<dyn ConsumerGroup>,
        storage: Arc<dyn DigestStorage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group,
            handler: Arc::new(MessageHandler::new(storage)),
            backoff: JoinBackoff::default(),
            state: Arc::new(SessionStateCell::new()),
            readiness: Arc::new(Readiness::new()),
            cancel: CancellationSource::new(),
            serving: AtomicBool::new(false),
            served: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: JoinBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// True once the current generation has its partitions assigned.
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready() && self.state.get().is_serving()
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        self.handler.stats()
    }

    /// Waits for the first generation that reaches setup.
    ///
    /// Returns false if the consumer is cancelled first.
    async fn wait_ready(&self) -> bool {
        let token = self.cancel.token();
        loop {
            let Some(waiter) = self.readiness.take_waiter() else {
                if self.readiness.is_ready() {
                    return true;
                }
                token.cancelled().await;
                return false;
            };
            tokio::select! {
                _ = token.cancelled() => return false,
                signaled = waiter => {
                    if signaled.is_ok() {
                        return true;
                    }
                    // superseded by a rejoin; wait on the new generation
                }
            }
        }
    }

    /// Joins the group generation after generation until cancelled.
    async fn run_join_loop(&self) -> Result<()> {
        let token = self.cancel.token();
        let mut failures: u32 = 0;
        let mut first_join = true;

        while !token.is_cancelled() {
            if !first_join {
                let generation = self.readiness.reset();
                debug!(generation = generation, "Readiness reset for new generation");
            }
            first_join = false;
            self.state.transition(SessionState::Joining);

            let claim_handler = Arc::new(ClaimHandler {
                handler: self.handler.clone(),
                state: self.state.clone(),
                readiness: self.readiness.clone(),
            });

            match self.group.consume(&self.topic, claim_handler, token.clone()).await {
                Ok(()) => {
                    failures = 0;
                    if token.is_cancelled() {
                        break;
                    }
                    metrics().rebalances.inc();
                    self.state.transition(SessionState::Rebalancing);
                    info!(topic = %self.topic, "Consumer group session ended, rejoining");
                }
                Err(_) if token.is_cancelled() => break,
                Err(Error::GroupClosed) => return Err(Error::GroupClosed),
                Err(e) => {
                    failures += 1;
                    health().broker.set_unhealthy(e.to_string());

                    if self.backoff.exhausted(failures) {
                        error!(
                            topic = %self.topic,
                            attempts = failures,
                            error = %e,
                            "Giving up joining the consumer group"
                        );
                        return Err(Error::JoinFailed {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = self.backoff.delay(failures);
                    warn!(
                        topic = %self.topic,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Error from consumer group, retrying join"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(topic = %self.topic, "Consumer group loop stopped");
        Ok(())
    }

    /// Marks serving as over and completes a pending close.
    fn finish_serving(&self) {
        self.served.store(true, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.state.transition(SessionState::Closed);
        }
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn serve(&self) -> Result<()> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("consumer is already serving"));
        }
        if self.cancel.is_cancelled() {
            self.finish_serving();
            return Ok(());
        }

        info!(topic = %self.topic, "Starting consumer");
        let join_loop = self.run_join_loop();
        tokio::pin!(join_loop);

        let result = tokio::select! {
            result = &mut join_loop => Some(result),
            ready = self.wait_ready() => {
                if ready {
                    info!(topic = %self.topic, "Consumer up and running");
                }
                None
            }
        };
        let result = match result {
            Some(result) => result,
            None => join_loop.await,
        };

        self.finish_serving();
        result
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Consumer already closed");
            return Ok(());
        }

        info!(topic = %self.topic, "Closing consumer");
        self.state.transition(SessionState::Closing);
        self.cancel.cancel();

        if let Err(e) = self.group.close().await {
            error!(error = %e, "Error closing consumer group");
        }

        // with a join loop still draining, serve completes the close
        if !self.serving.load(Ordering::SeqCst) || self.served.load(Ordering::SeqCst) {
            self.state.transition(SessionState::Closed);
        }
        info!(
            consumed = self.number_of_successfully_consumed_messages(),
            errors = self.number_of_errors_consuming_messages(),
            "Consumer closed"
        );
        Ok(())
    }

    async fn process_message(&self, message: &ConsumerMessage) -> Result<()> {
        self.handler.process_message(message).await
    }

    fn number_of_successfully_consumed_messages(&self) -> u64 {
        self.handler.stats().successes()
    }

    fn number_of_errors_consuming_messages(&self) -> u64 {
        self.handler.stats().errors()
    }
}

/// Group callbacks for one generation.
struct ClaimHandler {
    handler: Arc<MessageHandler>,
    state: Arc<SessionStateCell>,
    readiness: Arc<Readiness>,
}

#[async_trait]
impl ConsumerGroupHandler for ClaimHandler {
    async fn setup(&self, session: &GroupSession) -> Result<()> {
        info!(
            generation = session.generation_id(),
            member_id = %session.member_id(),
            claims = ?session.claims(),
            "Consumer group session set up"
        );
        metrics()
            .claimed_partitions
            .set(session.claims().len() as u64);
        health().broker.set_healthy();
        self.state.transition(SessionState::Ready);
        self.readiness.signal();
        Ok(())
    }

    async fn cleanup(&self, session: &GroupSession) -> Result<()> {
        info!(
            generation = session.generation_id(),
            "Consumer group session cleaned up"
        );
        metrics().claimed_partitions.set(0);
        Ok(())
    }

    async fn consume_claim(&self, session: &GroupSession, mut claim: PartitionClaim) -> Result<()> {
        self.state.transition(SessionState::Consuming);
        info!(
            topic = %claim.topic(),
            partition = claim.partition(),
            offset = claim.initial_offset(),
            "Consuming partition"
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = session.done() => break,
                message = claim.next_message() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            metrics().messages_consumed.inc();
            // outcome is logged and counted by the handler
            let _ = self.handler.handle(Some(&message)).await;
            session.mark_message(&message);
        }

        debug!(partition = claim.partition(), "Claim loop finished");
        Ok(())
    }
}
