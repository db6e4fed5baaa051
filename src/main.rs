//! Digest writer
//!
//! Consumes workload-inventory messages from a Kafka-compatible broker and
//! persists the image digests they carry:
//! - consumer-group sessions with per-partition ordered handling
//! - ClickHouse digest storage and committed offsets
//! - health and metrics probes over HTTP

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use api::{router, AppState};
use digest_core::{CancellationSource, DigestStorage, OffsetStorage};
use digest_store::{ClickHouseClient, ClickHouseConfig, ClickHouseOffsetStorage, ClickHouseStorage};
use redpanda::RedpandaConfig;
use telemetry::{health, init_tracing_from_env};
use worker::{Consumer, KafkaConsumer};

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    #[serde(default)]
    redpanda: RedpandaConfig,

    #[serde(default)]
    clickhouse: ClickHouseConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redpanda: RedpandaConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23+ requires explicit crypto provider selection before any TLS use
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting digest writer v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    config
        .redpanda
        .validate()
        .context("Invalid broker configuration")?;

    info!(
        brokers = %config.redpanda.broker_string(),
        group_id = %config.redpanda.group_id,
        topic = %config.redpanda.topic,
        member = config.redpanda.member_index,
        members = config.redpanda.member_count,
        timeout = config.redpanda.timeout.as_deref().unwrap_or("default"),
        "Loaded consumer config"
    );

    let clickhouse = ClickHouseClient::new(config.clickhouse.clone());

    if let Err(e) = digest_store::init_schema(&clickhouse).await {
        error!("Failed to initialize ClickHouse schema: {}", e);
        // Continue anyway - the table might already exist
    }

    check_health(&config, &clickhouse).await;

    let storage: Arc<dyn DigestStorage> = Arc::new(ClickHouseStorage::new(clickhouse.clone()));
    let offsets: Arc<dyn OffsetStorage> = Arc::new(ClickHouseOffsetStorage::new(clickhouse));

    let consumer = Arc::new(
        KafkaConsumer::connect(config.redpanda.clone(), storage, offsets)
            .await
            .context("Failed to create consumer group session")?,
    );

    let app = router(AppState::new(consumer.clone()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!("Probes listening on http://{}", addr);

    let http_shutdown = CancellationSource::new();
    let server = {
        let token = http_shutdown.token();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        })
    };

    let signals = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            if let Err(e) = consumer.close().await {
                error!("Failed to close consumer: {}", e);
            }
        })
    };

    let served = consumer.serve().await;

    info!("Shutting down...");
    signals.abort();
    if let Err(e) = consumer.close().await {
        error!("Failed to close consumer: {}", e);
    }
    http_shutdown.cancel();
    match server.await {
        Ok(Err(e)) => error!("Probe server error: {}", e),
        Err(e) => error!("Probe server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!(
        consumed = consumer.number_of_successfully_consumed_messages(),
        errors = consumer.number_of_errors_consuming_messages(),
        "Shutdown complete"
    );

    served.context("Consumer stopped with an error")
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::with_prefix("DIGEST_WRITER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("redpanda.brokers")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    apply_legacy_env(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Applies the `KAFKA_*` variables older deployments set.
///
/// They win over every other source so existing manifests keep working.
fn apply_legacy_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(address) = var("KAFKA_BROKER_ADDRESS") {
        config.redpanda.brokers = address
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(group) = var("KAFKA_BROKER_CONSUMER_GROUP") {
        config.redpanda.group_id = group;
    }
    if let Some(topic) = var("KAFKA_BROKER_INCOMING_TOPIC") {
        config.redpanda.topic = topic;
    }
    if let Some(timeout) = var("KAFKA_CONSUMER_TIMEOUT") {
        config.redpanda.timeout = Some(timeout);
    }
}

/// Check component health on startup.
async fn check_health(config: &Config, clickhouse: &ClickHouseClient) {
    if redpanda::health::check_connection(&config.redpanda).await {
        health().broker.set_healthy();
        info!("Broker connection: healthy");
    } else {
        health().broker.set_unhealthy("Connection failed");
        warn!("Broker connection: unhealthy");
    }

    if digest_store::check_connection(clickhouse).await {
        health().storage.set_healthy();
        info!("ClickHouse connection: healthy");
    } else {
        health().storage.set_unhealthy("Connection failed");
        warn!("ClickHouse connection: unhealthy");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
