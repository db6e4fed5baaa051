//! Tests for the health and metrics endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::{
    fixtures,
    setup::{wait_until, TestContext},
};
use std::time::Duration;
use worker::consumer::Consumer;

#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::new(1);
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    server.get("/health/live").await.assert_status_ok();
}

#[tokio::test]
async fn test_ready_endpoint_follows_session() {
    let mut ctx = TestContext::new(1);
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/health/ready").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "idle");

    ctx.start().await;
    server.get("/health/ready").await.assert_status_ok();

    ctx.shutdown().await.unwrap();
    let response = server.get("/health/ready").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "closed");
}

#[tokio::test]
async fn test_ready_endpoint_reports_closing_while_draining() {
    let mut ctx = TestContext::new(1);
    ctx.storage.set_write_delay(Duration::from_millis(300));
    ctx.start().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    ctx.produce(0, fixtures::TWO_DIGESTS);
    let storage = ctx.storage.clone();
    wait_until(move || storage.writes_started() == 1).await;
    ctx.consumer.close().await.unwrap();

    let response = server.get("/health/ready").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "closing");

    ctx.wait_for_serve().await.unwrap();
    let body: serde_json::Value = server.get("/health/ready").await.json();
    assert_eq!(body["status"], "closed");
}

#[tokio::test]
async fn test_health_endpoint_structure() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();

    let status = body["status"].as_str().unwrap_or("");
    assert!(
        ["healthy", "degraded", "unhealthy"].contains(&status),
        "unexpected status '{}'",
        status
    );
    assert!(body["session"] == "ready" || body["session"] == "consuming");
    assert_eq!(body["broker_connected"], true);
    assert!(body.get("storage_connected").is_some());
    assert_eq!(body["components"].as_array().map(Vec::len), Some(2));

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint_reports_consumer_counts() {
    let mut ctx = TestContext::new(1);
    ctx.start().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    ctx.produce(0, fixtures::TWO_DIGESTS);
    let last = ctx.produce(0, fixtures::MISSING_IMAGES);
    ctx.wait_for_commit(0, last).await;

    let response = server.get("/metrics").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();

    assert_eq!(body["consumer"]["consumed"], 1);
    assert_eq!(body["consumer"]["errors"], 1);
    assert!(body["pipeline"]["messages_consumed"].as_u64().unwrap_or(0) >= 2);
    assert!(body["pipeline"]["parse_errors"].as_u64().unwrap_or(0) >= 1);

    ctx.shutdown().await.unwrap();
}
