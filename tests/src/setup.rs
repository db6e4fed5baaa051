//! Common test setup functions.

use api::{router, AppState};
use axum::Router;
use digest_core::{DigestStorage, Result};
use digest_store::{
    init_schema, ClickHouseClient, ClickHouseConfig, ClickHouseOffsetStorage, ClickHouseStorage,
};
use redpanda::MemoryGroup;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use worker::{Consumer, JoinBackoff, KafkaConsumer};

use crate::containers::TestContainers;
use crate::mocks::MemoryStorage;

pub const TEST_TOPIC: &str = "workloads";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer wired to an in-process group and in-memory storage.
///
/// Runs the production consumer, handler and health router; only the
/// broker transport and the database are replaced.
pub struct TestContext {
    pub group: Arc<MemoryGroup>,
    pub storage: MemoryStorage,
    pub consumer: Arc<KafkaConsumer>,
    pub router: Router,
    serve: Option<JoinHandle<Result<()>>>,
}

impl TestContext {
    /// Create a test context over `partitions` empty partitions.
    pub fn new(partitions: i32) -> Self {
        Self::with_backoff(
            partitions,
            JoinBackoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(20),
                ..JoinBackoff::default()
            },
        )
    }

    /// Like [`TestContext::new`], with a custom join backoff.
    pub fn with_backoff(partitions: i32, backoff: JoinBackoff) -> Self {
        let group = Arc::new(MemoryGroup::new(TEST_TOPIC, partitions));
        let storage = MemoryStorage::new();
        let consumer = Arc::new(
            KafkaConsumer::with_group(
                TEST_TOPIC,
                group.clone(),
                Arc::new(storage.clone()) as Arc<dyn DigestStorage>,
            )
            .with_backoff(backoff),
        );
        let router = router(AppState::new(consumer.clone()));

        Self {
            group,
            storage,
            consumer,
            router,
            serve: None,
        }
    }

    /// Spawns `serve` without waiting for the group.
    pub fn spawn_serve(&mut self) {
        let consumer = self.consumer.clone();
        self.serve = Some(tokio::spawn(async move { consumer.serve().await }));
    }

    /// Spawns `serve` and waits until the first generation is ready.
    pub async fn start(&mut self) {
        self.spawn_serve();

        let consumer = self.consumer.clone();
        wait_until(move || consumer.is_ready()).await;
    }

    /// Appends a record to `partition` and returns its offset.
    pub fn produce(&self, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.group
            .produce(partition, Some(payload.into()))
            .expect("partition exists")
    }

    /// Waits until `partition` has acknowledged everything up to `offset`.
    pub async fn wait_for_commit(&self, partition: i32, offset: i64) {
        let group = self.group.clone();
        wait_until(move || group.committed_offset(partition) == Some(offset + 1)).await;
    }

    /// Closes the consumer and returns what `serve` returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.consumer.close().await?;
        self.wait_for_serve().await
    }

    /// Waits for the spawned `serve` to return, panicking after a timeout.
    pub async fn wait_for_serve(&mut self) -> Result<()> {
        match self.serve.take() {
            Some(handle) => tokio::time::timeout(WAIT_TIMEOUT, handle)
                .await
                .expect("serve did not return after close")
                .expect("serve task panicked"),
            None => Ok(()),
        }
    }
}

/// Polls `condition` until it holds, panicking after a timeout.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// ClickHouse-backed storage on a test container.
pub struct ClickHouseContext {
    pub containers: TestContainers,
    pub client: ClickHouseClient,
    pub storage: ClickHouseStorage,
    pub offsets: ClickHouseOffsetStorage,
}

impl ClickHouseContext {
    pub async fn new() -> Self {
        let containers = TestContainers::start().await;

        let client = ClickHouseClient::new(ClickHouseConfig {
            url: containers.clickhouse_url.clone(),
            database: containers.clickhouse_database.clone(),
            username: containers.clickhouse_username.clone(),
            password: containers.clickhouse_password.clone(),
            timeout_secs: 30,
        });

        init_schema(&client)
            .await
            .expect("Failed to initialize schema");

        let storage = ClickHouseStorage::new(client.clone());
        let offsets = ClickHouseOffsetStorage::new(client.clone());

        Self {
            containers,
            client,
            storage,
            offsets,
        }
    }
}
