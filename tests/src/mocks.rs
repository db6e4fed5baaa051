//! Mock implementations for testing.

use async_trait::async_trait;
use digest_core::{DigestStorage, Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory [`DigestStorage`] that keeps each digest once.
///
/// Implements the same trait as `ClickHouseStorage`, so the consumer runs
/// its production code paths against it.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    digests: Arc<Mutex<BTreeSet<String>>>,
    write_calls: Arc<Mutex<Vec<Vec<String>>>>,
    writes_started: Arc<AtomicUsize>,
    should_fail: Arc<Mutex<bool>>,
    write_delay: Arc<Mutex<Option<Duration>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored digest, ascending.
    pub fn digests(&self) -> Vec<String> {
        self.digests.lock().iter().cloned().collect()
    }

    /// Arguments of every successful write call, in call order.
    pub fn write_calls(&self) -> Vec<Vec<String>> {
        self.write_calls.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.write_calls.lock().len()
    }

    /// Write calls entered so far, finished or not.
    pub fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }

    /// Set failure mode for testing error handling.
    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock() = fail;
    }

    /// Makes every write sleep first, to keep handler calls in flight.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl DigestStorage for MemoryStorage {
    async fn write_digests(&self, digests: &[String]) -> Result<()> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.should_fail.lock() {
            return Err(Error::storage("mock storage failure"));
        }

        let mut sorted = digests.to_vec();
        sorted.sort();
        self.digests.lock().extend(sorted.iter().cloned());
        self.write_calls.lock().push(sorted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_deduplicates() {
        let storage = MemoryStorage::new();
        let batch = vec!["sha256:bb".to_string(), "sha256:aa".to_string()];

        storage.write_digests(&batch).await.unwrap();
        storage.write_digests(&batch).await.unwrap();

        assert_eq!(storage.digests(), vec!["sha256:aa", "sha256:bb"]);
        assert_eq!(storage.write_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_failure_mode() {
        let storage = MemoryStorage::new();
        storage.set_should_fail(true);

        let result = storage.write_digests(&["sha256:aa".to_string()]).await;
        assert!(result.is_err());
        assert!(storage.digests().is_empty());
        assert_eq!(storage.write_count(), 0);
        assert_eq!(storage.writes_started(), 1);
    }
}
