//! Consumer-group session lifecycle: rebalances, join retries, shutdown.

use integration_tests::{
    fixtures,
    setup::{wait_until, TestContext},
};
use std::time::Duration;
use worker::{Consumer, JoinBackoff, SessionState};

#[tokio::test]
async fn test_acknowledged_messages_are_not_redelivered_after_rebalance() {
    let mut ctx = TestContext::new(2);
    ctx.start().await;

    let first = ctx.produce(0, fixtures::digest_event(&fixtures::random_digests(1)));
    let second = ctx.produce(1, fixtures::digest_event(&fixtures::random_digests(1)));
    ctx.wait_for_commit(0, first).await;
    ctx.wait_for_commit(1, second).await;

    ctx.group.rebalance();
    let group = ctx.group.clone();
    let consumer = ctx.consumer.clone();
    wait_until(move || group.generation() == 2 && consumer.is_ready()).await;

    let third = ctx.produce(0, fixtures::digest_event(&fixtures::random_digests(1)));
    ctx.wait_for_commit(0, third).await;

    assert_eq!(ctx.storage.write_count(), 3);
    assert_eq!(ctx.consumer.stats().successes(), 3);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_rebalances_keep_consuming() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;

    for generation in 2..=4 {
        ctx.group.rebalance();
        let group = ctx.group.clone();
        let consumer = ctx.consumer.clone();
        wait_until(move || group.generation() == generation && consumer.is_ready()).await;

        let offset = ctx.produce(0, fixtures::TWO_DIGESTS);
        ctx.wait_for_commit(0, offset).await;
    }

    assert_eq!(ctx.consumer.stats().successes(), 3);
    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_join_failures_recover() {
    let mut ctx = TestContext::new(1);
    ctx.group.fail_next_joins(3);
    ctx.start().await;

    assert_eq!(ctx.group.join_attempts(), 4);
    assert_eq!(ctx.group.generation(), 1);

    let offset = ctx.produce(0, fixtures::TWO_DIGESTS);
    ctx.wait_for_commit(0, offset).await;
    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_message_completes_on_close() {
    let mut ctx = TestContext::new(1);
    ctx.storage.set_write_delay(Duration::from_millis(200));
    ctx.start().await;

    ctx.produce(0, fixtures::TWO_DIGESTS);
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.shutdown().await.unwrap();

    assert_eq!(ctx.storage.write_count(), 1);
    assert_eq!(ctx.consumer.stats().successes(), 1);
    assert_eq!(ctx.group.committed_offset(0), Some(1));
}

#[tokio::test]
async fn test_close_during_join_backoff_stops_retrying() {
    let mut ctx = TestContext::with_backoff(
        1,
        JoinBackoff {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
            ..JoinBackoff::default()
        },
    );
    ctx.group.fail_next_joins(u32::MAX);
    ctx.spawn_serve();

    let group = ctx.group.clone();
    wait_until(move || group.join_attempts() == 1).await;

    ctx.consumer.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), ctx.wait_for_serve())
        .await
        .expect("serve kept sleeping in backoff after close")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.group.join_attempts(), 1);
    assert_eq!(ctx.consumer.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_state_is_closing_until_in_flight_write_finishes() {
    let mut ctx = TestContext::new(1);
    ctx.storage.set_write_delay(Duration::from_millis(300));
    ctx.start().await;

    ctx.produce(0, fixtures::TWO_DIGESTS);
    let storage = ctx.storage.clone();
    wait_until(move || storage.writes_started() == 1).await;

    ctx.consumer.close().await.unwrap();
    assert_eq!(ctx.consumer.state(), SessionState::Closing);
    assert!(!ctx.consumer.is_ready());
    assert_eq!(ctx.storage.write_count(), 0);

    ctx.wait_for_serve().await.unwrap();
    assert_eq!(ctx.consumer.state(), SessionState::Closed);
    assert_eq!(ctx.storage.write_count(), 1);
    assert_eq!(ctx.group.committed_offset(0), Some(1));
}

#[tokio::test]
async fn test_no_messages_pulled_after_close() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;
    ctx.shutdown().await.unwrap();

    ctx.produce(0, fixtures::TWO_DIGESTS);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(ctx.storage.write_count(), 0);
    assert_eq!(ctx.group.committed_offset(0), None);
}

#[tokio::test]
async fn test_state_follows_lifecycle() {
    let mut ctx = TestContext::new(1);
    assert_eq!(ctx.consumer.state(), SessionState::Idle);

    ctx.start().await;
    assert!(ctx.consumer.state().is_serving());

    ctx.shutdown().await.unwrap();
    assert_eq!(ctx.consumer.state(), SessionState::Closed);
    assert!(!ctx.consumer.is_ready());
}
