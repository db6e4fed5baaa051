//! rskafka-backed consumer group.
//!
//! rskafka speaks the data-plane protocol only, so group membership is
//! resolved locally: each replica owns the partitions its `member_index`
//! selects out of `member_count`, and a metadata poll ends the generation
//! when that set changes. Marked offsets are committed to an
//! [`OffsetStorage`] keyed by group id, periodically and at the end of every
//! generation, and restored from it before the first join.

use async_trait::async_trait;
use digest_core::{CancelToken, CancellationSource, CommittedOffset, Error, OffsetStorage, Result};
use parking_lot::Mutex;
use rskafka::client::{
    error::{Error as ClientError, ProtocolError},
    partition::{OffsetAt, PartitionClient, UnknownTopicHandling},
    Client, ClientBuilder, Credentials, SaslConfig,
};
use rskafka::record::RecordAndOffset;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::health;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{OffsetReset, RedpandaConfig};
use crate::group::{
    run_generation, ConsumerGroup, ConsumerGroupHandler, GroupSession, OffsetStore, PartitionClaim,
};
use crate::message::ConsumerMessage;

/// Creates a TLS configuration for Redpanda Cloud.
fn create_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
}

/// Runs a broker request, bounded by `limit` when one is configured.
pub(crate) async fn within<T>(
    limit: Option<Duration>,
    what: &str,
    request: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, request)
            .await
            .map_err(|_| Error::broker(format!("{} timed out after {:?}", what, limit)))?,
        None => request.await,
    }
}

/// Connects to the configured brokers, honouring the network timeout.
pub(crate) async fn connect(config: &RedpandaConfig) -> Result<Client> {
    let mut builder = ClientBuilder::new(config.brokers.clone());

    // TLS and SASL only when credentials are provided (Redpanda Cloud)
    if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
        builder = builder
            .tls_config(create_tls_config())
            .sasl_config(SaslConfig::ScramSha256(Credentials::new(
                username.clone(),
                password.clone(),
            )));
    }

    within(config.timeout(), "connecting to brokers", async {
        builder
            .build()
            .await
            .map_err(|e| Error::broker(format!("Failed to connect to Redpanda: {}", e)))
    })
    .await
}

/// Where a claim starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPosition {
    Committed(i64),
    Reset(OffsetReset),
}

fn start_position(committed: Option<i64>, reset: OffsetReset) -> StartPosition {
    match committed {
        Some(offset) => StartPosition::Committed(offset),
        None => StartPosition::Reset(reset),
    }
}

/// Why a partition fetcher stopped.
#[derive(Debug)]
enum FetchFailure {
    /// The resume offset is no longer held by the broker (retention, truncation)
    OffsetOutOfRange { partition: i32, offset: i64 },
    Broker(Error),
}

impl FetchFailure {
    fn from_client(partition: i32, offset: i64, e: ClientError) -> Self {
        match e {
            ClientError::ServerError {
                protocol_error: ProtocolError::OffsetOutOfRange,
                ..
            } => Self::OffsetOutOfRange { partition, offset },
            e => Self::Broker(Error::broker(format!("Failed to fetch records: {}", e))),
        }
    }

    /// Applies the recovery for this failure and returns the error that ends
    /// the generation.
    ///
    /// An out-of-range resume point is dropped, so the next generation
    /// starts that partition from the reset policy instead of retrying the
    /// same offset forever.
    fn recover(self, offsets: &OffsetStore, topic: &str) -> Error {
        match self {
            Self::OffsetOutOfRange { partition, offset } => {
                offsets.forget(topic, partition);
                warn!(
                    topic = topic,
                    partition = partition,
                    offset = offset,
                    "Committed offset is out of range, resetting partition"
                );
                Error::broker(format!(
                    "offset {} of partition {} is out of range",
                    offset, partition
                ))
            }
            Self::Broker(e) => e,
        }
    }
}

/// Settings every partition fetcher needs.
#[derive(Debug, Clone, Copy)]
struct FetchSettings {
    max_bytes: i32,
    max_wait_ms: i32,
    timeout: Option<Duration>,
}

/// Consumer group on top of an rskafka client.
pub struct RedpandaGroup {
    config: RedpandaConfig,
    client: Client,
    member_id: String,
    /// Cached partition clients, dropped whenever a session breaks down
    partitions: RwLock<BTreeMap<i32, Arc<PartitionClient>>>,
    offsets: Arc<OffsetStore>,
    committer: Arc<dyn OffsetStorage>,
    restored: AtomicBool,
    generation: AtomicU64,
    closing: CancellationSource,
    closed: AtomicBool,
}

impl RedpandaGroup {
    /// Connects to the brokers. Failure here is a startup error.
    ///
    /// Committed offsets are read from `committer` on the first join, so an
    /// unreachable offset store is retried like any other join failure.
    pub async fn connect(config: RedpandaConfig, committer: Arc<dyn OffsetStorage>) -> Result<Self> {
        config.validate()?;

        info!(
            brokers = %config.broker_string(),
            group_id = %config.group_id,
            topic = %config.topic,
            member = config.member_index,
            members = config.member_count,
            "Creating Redpanda consumer group"
        );

        let client = connect(&config).await?;
        let member_id = format!("{}-{}", config.client_id, Uuid::new_v4());

        Ok(Self {
            config,
            client,
            member_id,
            partitions: RwLock::new(BTreeMap::new()),
            offsets: Arc::new(OffsetStore::new()),
            committer,
            restored: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closing: CancellationSource::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Committed resume point of a partition of the configured topic.
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.offsets.get(&self.config.topic, partition)
    }

    /// Loads the group's committed offsets once per process.
    async fn restore_offsets(&self, topic: &str) -> Result<()> {
        if self.restored.load(Ordering::SeqCst) {
            return Ok(());
        }

        let committed = self
            .committer
            .load_offsets(&self.config.group_id, topic)
            .await?;
        self.offsets.restore(topic, &committed);
        self.restored.store(true, Ordering::SeqCst);

        info!(
            group_id = %self.config.group_id,
            topic = topic,
            partitions = committed.len(),
            "Restored committed offsets"
        );
        Ok(())
    }

    /// Commits every resume point marked since the last flush.
    async fn flush_offsets(&self, topic: &str) -> Result<()> {
        let pending = self.offsets.pending(topic);
        if pending.is_empty() {
            return Ok(());
        }

        self.committer
            .commit_offsets(&self.config.group_id, topic, &pending)
            .await?;
        self.offsets.confirm(topic, &pending);
        debug!(partitions = pending.len(), "Committed offsets");
        Ok(())
    }

    /// Current partition set of `topic`.
    async fn discover_partitions(&self, topic: &str) -> Result<BTreeSet<i32>> {
        let topics = within(self.config.timeout(), "listing topics", async {
            self.client
                .list_topics()
                .await
                .map_err(|e| Error::broker(format!("Failed to list topics: {}", e)))
        })
        .await?;

        topics
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions)
            .filter(|partitions| !partitions.is_empty())
            .ok_or_else(|| Error::broker(format!("topic '{}' has no partitions", topic)))
    }

    /// Partitions of `topic` this member owns.
    async fn assignment(&self, topic: &str) -> Result<BTreeSet<i32>> {
        let partitions = self.discover_partitions(topic).await?;
        Ok(self.config.assigned(&partitions))
    }

    /// Gets or creates a partition client.
    async fn partition_client(&self, topic: &str, partition: i32) -> Result<Arc<PartitionClient>> {
        {
            let partitions = self.partitions.read().await;
            if let Some(client) = partitions.get(&partition) {
                return Ok(client.clone());
            }
        }

        let client = within(self.config.timeout(), "opening partition client", async {
            self.client
                .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
                .await
                .map_err(|e| Error::broker(format!("Failed to get partition client: {}", e)))
        })
        .await?;
        let client = Arc::new(client);

        self.partitions
            .write()
            .await
            .insert(partition, client.clone());

        Ok(client)
    }

    /// Resume point for a partition: committed offset, else the reset policy.
    async fn initial_offset(&self, client: &PartitionClient, topic: &str, partition: i32) -> Result<i64> {
        let at = match start_position(self.offsets.get(topic, partition), self.config.offset_reset) {
            StartPosition::Committed(offset) => return Ok(offset),
            StartPosition::Reset(OffsetReset::Earliest) => OffsetAt::Earliest,
            StartPosition::Reset(OffsetReset::Latest) => OffsetAt::Latest,
        };

        within(self.config.timeout(), "resolving start offset", async {
            client
                .get_offset(at)
                .await
                .map_err(|e| Error::broker(format!("Failed to get offset: {}", e)))
        })
        .await
    }

    /// Drops cached partition clients (for error recovery).
    async fn reset_connections(&self) {
        self.partitions.write().await.clear();
        debug!("Partition clients reset");
    }

    /// Commits the generation's offsets and turns a fetch failure into its
    /// recovery and the error the generation ends with.
    async fn finish_generation(
        &self,
        topic: &str,
        failure: &Mutex<Option<FetchFailure>>,
        result: Result<()>,
    ) -> Result<()> {
        if let Err(e) = self.flush_offsets(topic).await {
            warn!(error = %e, "Failed to commit offsets at end of generation");
        }

        let failed = failure.lock().take();
        if let Some(failed) = failed {
            let e = failed.recover(&self.offsets, topic);
            health().broker.set_unhealthy(e.to_string());
            self.reset_connections().await;
            return Err(e);
        }
        result
    }
}

#[async_trait]
impl ConsumerGroup for RedpandaGroup {
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancelToken,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::GroupClosed);
        }

        let session_source = CancellationSource::child_of(&cancel);
        session_source.cancel_on(self.closing.token());

        let joined = async {
            self.restore_offsets(topic).await?;
            self.assignment(topic).await
        };
        let assignment = match joined.await {
            Ok(assignment) => assignment,
            Err(e) => {
                session_source.cancel();
                health().broker.set_unhealthy(e.to_string());
                return Err(e);
            }
        };
        if assignment.is_empty() {
            info!(
                topic = topic,
                member = self.config.member_index,
                members = self.config.member_count,
                "No partitions left for this member"
            );
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = FetchSettings {
            max_bytes: self.config.fetch_max_bytes,
            max_wait_ms: self.config.fetch_max_wait_ms,
            timeout: self.config.fetch_timeout(),
        };

        let failure: Arc<Mutex<Option<FetchFailure>>> = Arc::new(Mutex::new(None));
        let mut fetchers = JoinSet::new();
        let mut claims = Vec::with_capacity(assignment.len());

        for &partition in &assignment {
            let setup = async {
                let client = self.partition_client(topic, partition).await?;
                let offset = self.initial_offset(&client, topic, partition).await?;
                Ok::<_, Error>((client, offset))
            };
            let (client, offset) = match setup.await {
                Ok(found) => found,
                Err(e) => {
                    session_source.cancel();
                    self.reset_connections().await;
                    return Err(e);
                }
            };

            let (tx, rx) = mpsc::channel(self.config.channel_buffer_size);
            claims.push(PartitionClaim::new(topic, partition, offset, rx));

            let fetcher = PartitionFetcher {
                client,
                topic: topic.to_string(),
                partition,
                settings,
            };
            let token = session_source.token();
            let source = session_source.clone();
            let failure = failure.clone();
            fetchers.spawn(async move {
                if let Err(e) = fetcher.run(offset, tx, token).await {
                    error!(partition = partition, error = ?e, "Partition fetch failed");
                    failure.lock().get_or_insert(e);
                    source.cancel();
                }
            });
        }

        health().broker.set_healthy();

        let session = Arc::new(GroupSession::new(
            generation,
            self.member_id.clone(),
            topic,
            assignment.iter().copied().collect(),
            self.offsets.clone(),
            session_source.token(),
        ));

        let watcher = {
            let source = session_source.clone();
            let token = session_source.token();
            let refresh = self.config.metadata_refresh();
            let assignment = &assignment;
            async move {
                let mut ticker = tokio::time::interval(refresh);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    match self.assignment(topic).await {
                        Ok(current) if current != *assignment => {
                            info!(
                                generation = generation,
                                previous = ?assignment,
                                current = ?current,
                                "Partition assignment changed, rebalancing"
                            );
                            source.cancel();
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Partition metadata refresh failed"),
                    }
                }
            }
        };

        let committer = {
            let token = session_source.token();
            let interval = self.config.commit_interval();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = self.flush_offsets(topic).await {
                        warn!(error = %e, "Failed to commit offsets, retrying next interval");
                    }
                }
            }
        };

        let (result, (), ()) = tokio::join!(
            async {
                let result = run_generation(handler, session, claims, &session_source).await;
                session_source.cancel();
                result
            },
            watcher,
            committer
        );

        while fetchers.join_next().await.is_some() {}

        self.finish_generation(topic, &failure, result).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.closing.cancel();
        if let Err(e) = self.flush_offsets(&self.config.topic).await {
            warn!(error = %e, "Failed to commit offsets on close");
        }
        self.reset_connections().await;
        info!(member_id = %self.member_id, "Consumer group closed");
        Ok(())
    }
}

/// Reads one partition into its claim channel.
struct PartitionFetcher {
    client: Arc<PartitionClient>,
    topic: String,
    partition: i32,
    settings: FetchSettings,
}

impl PartitionFetcher {
    async fn fetch(&self, offset: i64) -> std::result::Result<(Vec<RecordAndOffset>, i64), FetchFailure> {
        let request = self.client.fetch_records(
            offset,
            1..self.settings.max_bytes,
            self.settings.max_wait_ms,
        );
        let fetched = match self.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
                FetchFailure::Broker(Error::broker(format!(
                    "fetching records timed out after {:?}",
                    limit
                )))
            })?,
            None => request.await,
        };
        fetched.map_err(|e| FetchFailure::from_client(self.partition, offset, e))
    }

    async fn run(
        &self,
        mut offset: i64,
        tx: mpsc::Sender<ConsumerMessage>,
        token: CancelToken,
    ) -> std::result::Result<(), FetchFailure> {
        loop {
            let (records, high_watermark) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                fetched = self.fetch(offset) => fetched?,
            };

            if !records.is_empty() {
                debug!(
                    partition = self.partition,
                    records = records.len(),
                    offset = offset,
                    high_watermark = high_watermark,
                    "Fetched records"
                );
            }

            for record in records {
                // Compressed batches may start before the requested offset
                if record.offset < offset {
                    continue;
                }
                offset = record.offset + 1;

                let message = ConsumerMessage::from_record(&self.topic, self.partition, record);
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            if token.is_cancelled() {
                return Ok(());
            }
        }
    }
}
