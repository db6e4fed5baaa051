//! Digest writes.

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::Row;
use digest_core::{DigestStorage, Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use telemetry::{health, metrics};
use tracing::debug;

use crate::client::ClickHouseClient;
use crate::schema::DIGESTS_TABLE;

/// Row of the `image_digests` table.
#[derive(Debug, Clone, Row, Serialize)]
pub struct DigestRow {
    pub digest: String,
    /// milliseconds since epoch
    pub last_seen: i64,
}

/// Deduplicated rows for one write batch.
pub fn digest_rows(digests: &[String], seen_at_ms: i64) -> Vec<DigestRow> {
    digests
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|digest| DigestRow {
            digest: digest.to_string(),
            last_seen: seen_at_ms,
        })
        .collect()
}

/// [`DigestStorage`] that inserts into ClickHouse.
#[derive(Clone)]
pub struct ClickHouseStorage {
    client: ClickHouseClient,
}

impl ClickHouseStorage {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    async fn insert_rows(&self, rows: &[DigestRow]) -> Result<()> {
        let mut insert = self
            .client
            .inner()
            .insert(DIGESTS_TABLE)
            .map_err(|e| Error::storage(format!("Insert error: {}", e)))?;

        for row in rows {
            insert
                .write(row)
                .await
                .map_err(|e| Error::storage(format!("Write error: {}", e)))?;
        }

        insert
            .end()
            .await
            .map_err(|e| Error::storage(format!("End error: {}", e)))
    }
}

#[async_trait]
impl DigestStorage for ClickHouseStorage {
    async fn write_digests(&self, digests: &[String]) -> Result<()> {
        if digests.is_empty() {
            return Ok(());
        }

        let start = std::time::Instant::now();
        let rows = digest_rows(digests, Utc::now().timestamp_millis());

        let written = tokio::time::timeout(self.client.timeout(), self.insert_rows(&rows))
            .await
            .map_err(|_| Error::storage("digest insert timed out"))
            .and_then(|result| result);

        match written {
            Ok(()) => {
                health().storage.set_healthy();
                metrics().digests_written.inc_by(rows.len() as u64);
                debug!(
                    rows = rows.len(),
                    latency_ms = %start.elapsed().as_millis(),
                    "Inserted digests into ClickHouse"
                );
                Ok(())
            }
            Err(e) => {
                health().storage.set_unhealthy(e.to_string());
                Err(e)
            }
        }
    }
}
