//! Read-back queries over the digests table (tests and operators).

use crate::client::ClickHouseClient;
use crate::schema::DIGESTS_TABLE;
use digest_core::{Error, Result};

/// Number of distinct digests stored.
///
/// Counts distinct values so unmerged duplicate rows are not double counted.
pub async fn count_digests(client: &ClickHouseClient) -> Result<u64> {
    let count: u64 = client
        .inner()
        .query(&format!("SELECT uniqExact(digest) FROM {}", DIGESTS_TABLE))
        .fetch_one()
        .await
        .map_err(|e| Error::storage(format!("Query error: {}", e)))?;
    Ok(count)
}

/// Stored digests in ascending order.
pub async fn list_digests(client: &ClickHouseClient, limit: u32) -> Result<Vec<String>> {
    client
        .inner()
        .query(&format!(
            "SELECT DISTINCT digest FROM {} ORDER BY digest LIMIT ?",
            DIGESTS_TABLE
        ))
        .bind(limit)
        .fetch_all::<String>()
        .await
        .map_err(|e| Error::storage(format!("Query error: {}", e)))
}

/// Removes every stored digest.
pub async fn truncate_digests(client: &ClickHouseClient) -> Result<()> {
    client
        .inner()
        .query(&format!("TRUNCATE TABLE IF EXISTS {}", DIGESTS_TABLE))
        .execute()
        .await
        .map_err(|e| Error::storage(format!("Truncate error: {}", e)))
}
