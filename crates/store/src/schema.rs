//! ClickHouse table schemas.
//!
//! `ReplacingMergeTree` collapses rows with the same digest, so writing a
//! redelivered message converges to the state of a single write. Committed
//! consumer offsets live next to the digests, one row per commit.

/// Table holding one row per known image digest.
pub const DIGESTS_TABLE: &str = "image_digests";

/// SQL for creating the digests table.
pub fn create_digests_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.{DIGESTS_TABLE} (
    digest String,
    last_seen DateTime64(3)
)
ENGINE = ReplacingMergeTree(last_seen)
ORDER BY digest
SETTINGS index_granularity = 8192
"#
    )
}

/// Table holding committed consumer-group offsets.
pub const OFFSETS_TABLE: &str = "consumer_offsets";

/// SQL for creating the committed offsets table.
pub fn create_offsets_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.{OFFSETS_TABLE} (
    group_id String,
    topic String,
    partition Int32,
    next_offset Int64,
    committed_at DateTime64(3)
)
ENGINE = ReplacingMergeTree(committed_at)
ORDER BY (group_id, topic, partition)
"#
    )
}

/// All DDL statements, in execution order.
pub fn all_tables(database: &str) -> Vec<String> {
    vec![create_digests_table(database), create_offsets_table(database)]
}
