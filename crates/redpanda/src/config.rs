//! Redpanda consumer configuration.

use digest_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::warn;

/// Where to start reading a partition that has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// Redpanda consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses
    #[serde(default)]
    pub brokers: Vec<String>,
    /// Consumer group identifier
    #[serde(default)]
    pub group_id: String,
    /// Topic carrying workload-inventory messages
    #[serde(default)]
    pub topic: String,
    /// Bound on dialing and on every metadata, offset and fetch request,
    /// e.g. "10s" or "1m30s". Fetches also get `fetch_max_wait_ms` on top.
    #[serde(default)]
    pub timeout: Option<String>,
    /// SASL username (for cloud authentication)
    #[serde(default)]
    pub sasl_username: Option<String>,
    /// SASL password (for cloud authentication)
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub offset_reset: OffsetReset,
    /// Upper bound of a single fetch response in bytes
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,
    /// How long the broker may hold a fetch waiting for data
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: i32,
    /// Messages buffered per partition claim
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Interval between partition-metadata checks that detect rebalances
    #[serde(default = "default_metadata_refresh_ms")]
    pub metadata_refresh_ms: u64,
    /// How often marked offsets are committed to offset storage
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
    /// Number of replicas sharing the group; partitions are split among them
    #[serde(default = "default_member_count")]
    pub member_count: u32,
    /// Position of this replica among `member_count`, starting at 0
    #[serde(default)]
    pub member_index: u32,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024
}

fn default_fetch_max_wait_ms() -> i32 {
    500
}

fn default_channel_buffer_size() -> usize {
    256
}

fn default_metadata_refresh_ms() -> u64 {
    30_000
}

fn default_commit_interval_ms() -> u64 {
    1_000
}

fn default_member_count() -> u32 {
    1
}

fn default_client_id() -> String {
    "digest-writer".to_string()
}

impl Default for RedpandaConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            group_id: String::new(),
            topic: String::new(),
            timeout: None,
            sasl_username: None,
            sasl_password: None,
            offset_reset: OffsetReset::default(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            channel_buffer_size: default_channel_buffer_size(),
            metadata_refresh_ms: default_metadata_refresh_ms(),
            commit_interval_ms: default_commit_interval_ms(),
            member_count: default_member_count(),
            member_index: 0,
            client_id: default_client_id(),
        }
    }
}

impl RedpandaConfig {
    /// Returns the broker list as a comma-separated string.
    pub fn broker_string(&self) -> String {
        self.brokers.join(",")
    }

    /// Checks that every value the consumer cannot run without is present.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::config("broker address is not set"));
        }
        if self.group_id.trim().is_empty() {
            return Err(Error::config("consumer group is not set"));
        }
        if self.topic.trim().is_empty() {
            return Err(Error::config("incoming topic is not set"));
        }
        if self.channel_buffer_size == 0 {
            return Err(Error::config("channel_buffer_size must be positive"));
        }
        if self.fetch_max_bytes <= 1 {
            return Err(Error::config("fetch_max_bytes must be greater than 1"));
        }
        if self.member_count == 0 {
            return Err(Error::config("member_count must be positive"));
        }
        if self.member_index >= self.member_count {
            return Err(Error::config(format!(
                "member_index {} is out of range for {} members",
                self.member_index, self.member_count
            )));
        }
        Ok(())
    }

    /// Network timeout, if one is configured.
    ///
    /// Unparseable or zero values leave the client defaults in place.
    pub fn timeout(&self) -> Option<Duration> {
        let raw = self.timeout.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match parse_duration(raw) {
            Some(timeout) if !timeout.is_zero() => Some(timeout),
            Some(_) => None,
            None => {
                warn!(timeout = raw, "Ignoring unparseable consumer timeout");
                None
            }
        }
    }

    /// Bound on a single fetch: the broker may hold it for
    /// `fetch_max_wait_ms` before the network timeout starts to matter.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        let max_wait = Duration::from_millis(u64::try_from(self.fetch_max_wait_ms).unwrap_or(0));
        self.timeout().map(|timeout| timeout + max_wait)
    }

    pub fn metadata_refresh(&self) -> Duration {
        Duration::from_millis(self.metadata_refresh_ms.max(1))
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms.max(1))
    }

    /// Partitions of `partitions` this replica owns.
    pub fn assigned<'a>(&self, partitions: impl IntoIterator<Item = &'a i32>) -> BTreeSet<i32> {
        let count = i64::from(self.member_count.max(1));
        let index = i64::from(self.member_index);
        partitions
            .into_iter()
            .copied()
            .filter(|&partition| i64::from(partition).rem_euclid(count) == index)
            .collect()
    }
}

/// Parses durations such as `500ms`, `10s`, `1m30s` or `2h`.
pub fn parse_duration(literal: &str) -> Option<Duration> {
    let bytes = literal.as_bytes();
    if bytes.is_empty() {
        return None;
    }

    let mut total_ms = 0u64;
    let mut idx = 0usize;
    while idx < bytes.len() {
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if start == idx {
            return None;
        }
        let value: u64 = literal[start..idx].parse().ok()?;

        let unit_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        let factor = match &literal[unit_start..idx] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(factor)?)?;
    }

    Some(Duration::from_millis(total_ms))
}
