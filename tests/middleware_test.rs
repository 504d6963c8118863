//! End-to-end scenarios through the full router and middleware stack

mod common;

use std::sync::Arc;

use common::{FailingStore, TestConfigBuilder, build_context, memory_server, test_server};
use quotagate::infrastructure::health::HealthStatus;

const FREE_KEY: &str = "demo_free_key_123";
const PRO_KEY: &str = "demo_pro_key_789";
const ENTERPRISE_KEY: &str = "demo_enterprise_key_abc";

fn header(response: &axum_test::TestResponse, name: &str) -> String {
    response
        .maybe_header(name)
        .map(|v| v.to_str().unwrap_or_default().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_free_tier_burst_in_normal_health() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    for i in 1..=20 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", FREE_KEY)
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should be admitted");
        assert_eq!(header(&response, "x-ratelimit-limit"), "20");
        if i == 20 {
            assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
        }
        assert!(!header(&response, "x-request-id").is_empty());
    }

    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", FREE_KEY)
        .await;
    assert_eq!(response.status_code(), 429);
    assert_eq!(header(&response, "x-ratelimit-limit"), "20");
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert!(!header(&response, "retry-after").is_empty());

    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["details"]["tier"], "free");
    assert_eq!(body["details"]["limit"], 20);
}

#[tokio::test]
async fn test_free_tier_shed_in_degraded_health() {
    let (ctx, server) = memory_server(TestConfigBuilder::new().build());

    // The write invalidates the local cache, so the new state is visible
    // to the very next request.
    ctx.health
        .set(HealthStatus::Degraded, "test", "load shedding", None)
        .await
        .unwrap();

    for i in 1..=2 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", FREE_KEY)
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should be admitted");
        assert_eq!(header(&response, "x-ratelimit-limit"), "2");
    }

    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", FREE_KEY)
        .await;
    assert_eq!(response.status_code(), 429);
    assert_eq!(header(&response, "x-ratelimit-limit"), "2");
}

#[tokio::test]
async fn test_pro_tier_keeps_sla_in_degraded_health() {
    let (ctx, server) = memory_server(TestConfigBuilder::new().build());

    ctx.health
        .set(HealthStatus::Degraded, "test", "load shedding", None)
        .await
        .unwrap();

    for i in 1..=100 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", PRO_KEY)
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should be admitted");
        assert_eq!(header(&response, "x-ratelimit-limit"), "100");
    }

    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", PRO_KEY)
        .await;
    assert_eq!(response.status_code(), 429);
    assert_eq!(header(&response, "x-ratelimit-limit"), "100");
}

#[tokio::test]
async fn test_enterprise_tier_unchanged_by_health_toggle() {
    let (ctx, server) = memory_server(TestConfigBuilder::new().build());

    for i in 1..=500 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", ENTERPRISE_KEY)
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should be admitted");
        assert_eq!(header(&response, "x-ratelimit-limit"), "1000");
    }

    ctx.health
        .set(HealthStatus::Degraded, "test", "toggle", None)
        .await
        .unwrap();

    for i in 501..=1000 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", ENTERPRISE_KEY)
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should be admitted");
        assert_eq!(header(&response, "x-ratelimit-limit"), "1000");
    }

    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", ENTERPRISE_KEY)
        .await;
    assert_eq!(response.status_code(), 429);
}

#[tokio::test]
async fn test_invalid_credential_abuse_escalates_to_block() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    // Ten invalid attempts from one address: each gets its 401
    for i in 1..=10 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", "bogus")
            .add_header("x-forwarded-for", "203.0.113.7")
            .await;
        assert_eq!(response.status_code(), 401, "attempt {i} should be 401");
        let body: serde_json::Value = response.json();
        assert_eq!(body["code"], "MALFORMED_API_KEY");
    }

    // The block now applies to any credential from that address
    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", FREE_KEY)
        .add_header("x-forwarded-for", "203.0.113.7")
        .await;
    assert_eq!(response.status_code(), 429);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "IP_BLOCKED");

    let retry_after: u64 = header(&response, "retry-after").parse().unwrap();
    assert!(retry_after > 890 && retry_after <= 900);

    // Other addresses are unaffected
    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", FREE_KEY)
        .add_header("x-forwarded-for", "203.0.113.8")
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_unknown_credential_returns_invalid_api_key() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", "well_formed_but_unknown_key")
        .await;
    assert_eq!(response.status_code(), 401);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "INVALID_API_KEY");
    assert!(!header(&response, "x-request-id").is_empty());
}

#[tokio::test]
async fn test_missing_credential_returns_401() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    let response = server.get("/api/v1/limits").await;
    assert_eq!(response.status_code(), 401);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "MISSING_API_KEY");
}

#[tokio::test]
async fn test_store_outage_fails_open_with_degraded_header() {
    let ctx = build_context(TestConfigBuilder::new().build(), Arc::new(FailingStore));
    let server = test_server(ctx.clone());

    // Past the breaker threshold every call short-circuits; requests keep
    // completing and are admitted with degraded enforcement marking.
    for i in 1..=10 {
        let response = server
            .get("/api/v1/limits")
            .add_header("x-api-key", FREE_KEY)
            .await;
        assert_eq!(response.status_code(), 200, "request {i} should fail open");
        assert_eq!(header(&response, "x-ratelimit-degraded"), "true");
    }
}

#[tokio::test]
async fn test_allowlisted_paths_bypass_rate_limiting() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    // No credential, no rate headers, no decision recorded
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    assert!(header(&response, "x-ratelimit-limit").is_empty());
}

#[tokio::test]
async fn test_service_health_reports_components() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["store"], "healthy");
    assert_eq!(body["components"]["system_health"], "NORMAL");
    assert_eq!(body["components"]["circuit_breaker"], "closed");
}

#[tokio::test]
async fn test_limits_endpoint_reports_window_status() {
    let (_ctx, server) = memory_server(TestConfigBuilder::new().build());

    // Two prior admissions, then the status call itself consumes a third
    for _ in 0..2 {
        server
            .get("/api/v1/limits")
            .add_header("x-api-key", FREE_KEY)
            .await;
    }

    let response = server
        .get("/api/v1/limits")
        .add_header("x-api-key", FREE_KEY)
        .await;
    assert_eq!(response.status_code(), 200);

    let body: serde_json::Value = response.json();
    assert_eq!(body["user_id"], "demo_free_user");
    assert_eq!(body["tier"], "free");
    assert_eq!(body["system_health"], "NORMAL");
    assert_eq!(body["effective_limit"], 20);
    assert_eq!(body["current_count"], 3);
    assert_eq!(body["window_seconds"], 60);
}
