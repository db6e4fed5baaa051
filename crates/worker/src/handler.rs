//! Per-message pipeline: parse → extract → persist.
//!
//! The handler never retries. A message that fails parsing or storage is
//! logged, counted and reported to the caller, which still acknowledges
//! it so a poison message cannot stall its partition.

use digest_core::{extract_digests, parse_message, DigestStorage, Result};
use redpanda::ConsumerMessage;
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics;
use tracing::{error, info, warn};

use crate::stats::ConsumerStats;

/// Handles consumed messages and tracks their outcome.
pub struct MessageHandler {
    storage: Arc<dyn DigestStorage>,
    stats: Arc<ConsumerStats>,
}

impl MessageHandler {
    pub fn new(storage: Arc<dyn DigestStorage>) -> Self {
        Self {
            storage,
            stats: Arc::new(ConsumerStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    /// Handles one message, including logging and outcome counting.
    ///
    /// An absent or empty message is a no-op, not a failure.
    pub async fn handle(&self, message: Option<&ConsumerMessage>) -> Result<()> {
        let Some(message) = message else {
            info!("nil message");
            return Ok(());
        };
        if message.payload().is_none() {
            info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Empty message, nothing to process"
            );
            return Ok(());
        }

        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            message_timestamp = %message.timestamp,
            "Start processing incoming message"
        );

        let start = Instant::now();
        let result = self.process_message(message).await;
        let elapsed = start.elapsed();
        metrics()
            .processing_latency_ms
            .observe(elapsed.as_millis() as u64);

        match result {
            Ok(()) => {
                info!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    processing_duration = elapsed.as_secs_f64(),
                    "Processed incoming message successfully"
                );
                self.stats.record_success();
                Ok(())
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    kind = e.kind(),
                    "Error processing the message consumed from Kafka"
                );
                self.stats.record_error();
                Err(e)
            }
        }
    }

    /// Parses the message, extracts its digests and writes them to storage.
    pub async fn process_message(&self, message: &ConsumerMessage) -> Result<()> {
        let start = Instant::now();

        let event = match parse_message(message.payload().unwrap_or_default()) {
            Ok(event) => event,
            Err(e) => {
                metrics().parse_errors.inc();
                return Err(e);
            }
        };
        metrics().parsed_ok.inc();
        info!("Parsed incoming message successfully");

        let digests = match event.digests.as_ref() {
            Some(digests) if !digests.is_empty() => extract_digests(digests),
            _ => {
                info!("No digests were retrieved from incoming message");
                return Ok(());
            }
        };

        info!(digests = digests.len(), "Extracted digests");
        if usize::try_from(event.image_count).ok() != Some(digests.len()) {
            warn!(
                expected = event.image_count,
                extracted = digests.len(),
                "Number of extracted digests differs from imageCount"
            );
        }

        if let Err(e) = self.storage.write_digests(&digests).await {
            error!(error = %e, "Error writing digests to database");
            metrics().store_errors.inc();
            return Err(e);
        }
        metrics().stored_ok.inc();

        info!(
            processing_duration = start.elapsed().as_secs_f64(),
            "Stored digests successfully"
        );
        Ok(())
    }
}
