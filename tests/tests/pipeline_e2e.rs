//! End-to-end tests for the digest pipeline.
//!
//! Messages go through the production consumer:
//! MemoryGroup → KafkaConsumer → MessageHandler → MemoryStorage
//!
//! MemoryGroup implements the same ConsumerGroup trait as RedpandaGroup,
//! so every code path except the broker transport is exercised.

use digest_core::{DigestStorage, Error, MISSING_DIGESTS};
use integration_tests::{
    fixtures,
    mocks::MemoryStorage,
    setup::{wait_until, TestContext, TEST_TOPIC},
};
use redpanda::ConsumerMessage;
use std::sync::Arc;
use std::time::Duration;
use worker::{Consumer, MessageHandler};

#[tokio::test]
async fn test_two_digests_are_written_once() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    let offset = ctx.produce(0, fixtures::TWO_DIGESTS);
    ctx.wait_for_commit(0, offset).await;

    assert_eq!(
        ctx.storage.write_calls(),
        vec![vec!["sha256:aa".to_string(), "sha256:bb".to_string()]]
    );
    assert_eq!(ctx.consumer.number_of_successfully_consumed_messages(), 1);
    assert_eq!(ctx.consumer.number_of_errors_consuming_messages(), 0);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_image_count_mismatch_still_writes() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    let offset = ctx.produce(0, fixtures::COUNT_MISMATCH);
    ctx.wait_for_commit(0, offset).await;

    assert_eq!(ctx.storage.write_calls(), vec![vec!["sha256:aa".to_string()]]);
    assert_eq!(ctx.consumer.number_of_successfully_consumed_messages(), 1);
    assert_eq!(ctx.consumer.number_of_errors_consuming_messages(), 0);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poison_messages_are_counted_and_skipped() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    ctx.produce(0, fixtures::MISSING_IMAGES);
    ctx.produce(0, fixtures::EMPTY_IMAGES);
    ctx.produce(0, fixtures::MALFORMED);
    let last = ctx.produce(0, fixtures::TWO_DIGESTS);
    ctx.wait_for_commit(0, last).await;

    assert_eq!(ctx.consumer.number_of_errors_consuming_messages(), 3);
    assert_eq!(ctx.consumer.number_of_successfully_consumed_messages(), 1);
    assert_eq!(ctx.storage.write_count(), 1);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_images_error_message() {
    let ctx = TestContext::new(1);
    let message = ConsumerMessage::new(
        TEST_TOPIC,
        0,
        0,
        Some(fixtures::MISSING_IMAGES.as_bytes().to_vec()),
    );

    let err = ctx.consumer.process_message(&message).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(err.to_string(), MISSING_DIGESTS);
    assert_eq!(ctx.storage.write_count(), 0);
}

#[tokio::test]
async fn test_storage_failure_is_skipped() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    ctx.storage.set_should_fail(true);
    let failed = ctx.produce(0, fixtures::TWO_DIGESTS);
    ctx.wait_for_commit(0, failed).await;
    assert_eq!(ctx.consumer.number_of_errors_consuming_messages(), 1);
    assert_eq!(ctx.consumer.number_of_successfully_consumed_messages(), 0);

    ctx.storage.set_should_fail(false);
    let next = ctx.produce(0, fixtures::COUNT_MISMATCH);
    ctx.wait_for_commit(0, next).await;
    assert_eq!(ctx.consumer.number_of_successfully_consumed_messages(), 1);
    assert_eq!(ctx.storage.digests(), vec!["sha256:aa"]);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_and_absent_payloads_are_no_ops() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    ctx.group.produce(0, None).unwrap();
    let last = ctx.produce(0, Vec::<u8>::new());
    ctx.wait_for_commit(0, last).await;

    assert_eq!(ctx.consumer.number_of_errors_consuming_messages(), 0);
    assert_eq!(ctx.consumer.number_of_successfully_consumed_messages(), 0);
    assert_eq!(ctx.storage.write_count(), 0);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handling_same_message_twice_is_idempotent() {
    let storage = MemoryStorage::new();
    let handler = MessageHandler::new(Arc::new(storage.clone()) as Arc<dyn DigestStorage>);
    let digests = fixtures::random_digests(3);
    let message = ConsumerMessage::new(TEST_TOPIC, 0, 9, Some(fixtures::digest_event(&digests)));

    handler.handle(Some(&message)).await.unwrap();
    let after_once = storage.digests();
    handler.handle(Some(&message)).await.unwrap();

    assert_eq!(storage.digests(), after_once);
    let mut expected = digests.clone();
    expected.sort();
    assert_eq!(after_once, expected);
}

#[tokio::test]
async fn test_counters_are_consistent_across_partitions() {
    const PER_PARTITION: usize = 40;

    let mut ctx = TestContext::new(2);
    ctx.storage.set_write_delay(Duration::from_millis(1));
    ctx.start().await;

    let mut expected = Vec::new();
    let mut last = [0i64; 2];
    for i in 0..PER_PARTITION {
        for (partition, last_offset) in last.iter_mut().enumerate() {
            let payload = if i % 4 == 3 {
                fixtures::MISSING_IMAGES.as_bytes().to_vec()
            } else {
                let digests = fixtures::random_digests(2);
                expected.extend(digests.iter().cloned());
                fixtures::digest_event(&digests)
            };
            *last_offset = ctx.produce(partition as i32, payload);
        }
    }

    ctx.wait_for_commit(0, last[0]).await;
    ctx.wait_for_commit(1, last[1]).await;

    let failures = 2 * (PER_PARTITION / 4) as u64;
    let total = 2 * PER_PARTITION as u64;
    assert_eq!(ctx.consumer.number_of_errors_consuming_messages(), failures);
    assert_eq!(
        ctx.consumer.number_of_successfully_consumed_messages(),
        total - failures
    );

    expected.sort();
    assert_eq!(ctx.storage.digests(), expected);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partition_order_is_preserved() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    let batches: Vec<Vec<String>> = (0..10).map(|_| fixtures::random_digests(1)).collect();
    let mut last = 0;
    for batch in &batches {
        last = ctx.produce(0, fixtures::digest_event(batch));
    }
    ctx.wait_for_commit(0, last).await;

    assert_eq!(ctx.storage.write_calls(), batches);
    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_twice_serve_returns_once() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    let offset = ctx.produce(0, fixtures::TWO_DIGESTS);
    ctx.wait_for_commit(0, offset).await;

    ctx.consumer.close().await.unwrap();
    ctx.consumer.close().await.unwrap();
    ctx.shutdown().await.unwrap();

    let group = ctx.group.clone();
    wait_until(move || group.is_closed()).await;
    assert!(ctx.consumer.serve().await.is_err());
}
