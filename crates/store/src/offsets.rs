//! Committed consumer offsets.
//!
//! Every commit appends one row per partition. Reads take the newest row of
//! each partition, so unmerged history never shadows the latest commit.

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::Row;
use digest_core::{CommittedOffset, Error, OffsetStorage, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ClickHouseClient;
use crate::schema::OFFSETS_TABLE;

/// Row of the `consumer_offsets` table.
#[derive(Debug, Clone, Row, Serialize)]
pub struct OffsetRow {
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    pub next_offset: i64,
    /// milliseconds since epoch
    pub committed_at: i64,
}

#[derive(Debug, Row, Deserialize)]
struct LatestOffset {
    partition: i32,
    resume_at: i64,
}

/// Rows for one commit of `offsets`.
pub fn offset_rows(
    group_id: &str,
    topic: &str,
    offsets: &[CommittedOffset],
    committed_at_ms: i64,
) -> Vec<OffsetRow> {
    offsets
        .iter()
        .map(|entry| OffsetRow {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            partition: entry.partition,
            next_offset: entry.next_offset,
            committed_at: committed_at_ms,
        })
        .collect()
}

/// [`OffsetStorage`] backed by the `consumer_offsets` table.
#[derive(Clone)]
pub struct ClickHouseOffsetStorage {
    client: ClickHouseClient,
}

impl ClickHouseOffsetStorage {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    async fn insert_rows(&self, rows: &[OffsetRow]) -> Result<()> {
        let mut insert = self
            .client
            .inner()
            .insert(OFFSETS_TABLE)
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
impl OffsetStorage for ClickHouseOffsetStorage {
    async fn load_offsets(&self, group_id: &str, topic: &str) -> Result<Vec<CommittedOffset>> {
        let query = self
            .client
            .inner()
            .query(&format!(
                "SELECT partition, argMax(next_offset, committed_at) AS resume_at \
                 FROM {} WHERE group_id = ? AND topic = ? \
                 GROUP BY partition ORDER BY partition",
                OFFSETS_TABLE
            ))
            .bind(group_id)
            .bind(topic)
            .fetch_all::<LatestOffset>();

        let rows = tokio::time::timeout(self.client.timeout(), query)
            .await
            .map_err(|_| Error::storage("loading committed offsets timed out"))?
            .map_err(|e| Error::storage(format!("Query error: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| CommittedOffset::new(row.partition, row.resume_at))
            .collect())
    }

    async fn commit_offsets(
        &self,
        group_id: &str,
        topic: &str,
        offsets: &[CommittedOffset],
    ) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let rows = offset_rows(group_id, topic, offsets, Utc::now().timestamp_millis());
        tokio::time::timeout(self.client.timeout(), self.insert_rows(&rows))
            .await
            .map_err(|_| Error::storage("offset commit timed out"))??;

        debug!(
            group_id = group_id,
            topic = topic,
            partitions = rows.len(),
            "Committed offsets to ClickHouse"
        );
        Ok(())
    }
}
