//! Common test utilities shared across integration tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum_test::TestServer;

use quotagate::config::{Config, ConfigSnapshot, SnapshotHandle, TierConfig};
use quotagate::infrastructure::abuse::AbuseGuard;
use quotagate::infrastructure::health::HealthService;
use quotagate::infrastructure::rate_limiter::RateLimitService;
use quotagate::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};
use quotagate::infrastructure::store::{
    MemoryStore, RateStore, ResilientStore, StoreError, WindowReply,
};
use quotagate::presentation::{AppContext, create_router};

/// Builder for consistent test configurations
pub struct TestConfigBuilder {
    config: Config,
}

impl TestConfigBuilder {
    /// Demo tiers, users and credentials matching the shipped example
    /// configuration.
    pub fn new() -> Self {
        let mut config = Config::default();

        config.tiers.insert(
            "free".to_string(),
            TierConfig {
                base_limit: 10,
                burst_limit: 20,
                degraded_limit: 2,
                window_minutes: 1,
            },
        );
        config.tiers.insert(
            "pro".to_string(),
            TierConfig {
                base_limit: 100,
                burst_limit: 150,
                degraded_limit: 100,
                window_minutes: 1,
            },
        );
        config.tiers.insert(
            "enterprise".to_string(),
            TierConfig {
                base_limit: 1000,
                burst_limit: 1000,
                degraded_limit: 1000,
                window_minutes: 1,
            },
        );

        config
            .users
            .insert("demo_free_user".to_string(), "free".to_string());
        config
            .users
            .insert("demo_pro_user".to_string(), "pro".to_string());
        config
            .users
            .insert("demo_enterprise_user".to_string(), "enterprise".to_string());

        config
            .api_keys
            .insert("demo_free_key_123".to_string(), "demo_free_user".to_string());
        config
            .api_keys
            .insert("demo_pro_key_789".to_string(), "demo_pro_user".to_string());
        config.api_keys.insert(
            "demo_enterprise_key_abc".to_string(),
            "demo_enterprise_user".to_string(),
        );

        Self { config }
    }

    pub fn with_admin_key(mut self, key: &str) -> Self {
        self.config.admin_key = Some(key.to_string());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A store that refuses every operation, standing in for an unreachable
/// shared store.
pub struct FailingStore;

#[async_trait]
impl RateStore for FailingStore {
    async fn check_window(
        &self,
        _: &str,
        _: u64,
        _: u32,
        _: u64,
        _: &str,
    ) -> Result<WindowReply, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn window_count(&self, _: &str, _: u64, _: u64) -> Result<u32, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn hash_get_all(&self, _: &str) -> Result<HashMap<String, String>, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn hash_put(
        &self,
        _: &str,
        _: &[(String, String)],
        _: Option<Duration>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn increment_with_expiry(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn flag_set(&self, _: &str, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn flag_ttl(&self, _: &str) -> Result<Option<u64>, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
    async fn ping(&self) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
}

/// Wire a full application context over the given backend store.
///
/// The per-call deadline is generous; in-process stores never need the
/// 5 ms production deadline.
pub fn build_context(config: Config, backend: Arc<dyn RateStore>) -> AppContext {
    build_context_with_path(config, backend, None)
}

/// Like [`build_context`], with a configuration file path so reload and
/// write-back paths can be exercised.
pub fn build_context_with_path(
    config: Config,
    backend: Arc<dyn RateStore>,
    path: Option<std::path::PathBuf>,
) -> AppContext {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold,
        recovery_timeout: Duration::from_secs(config.circuit_breaker.recovery_timeout_seconds),
        half_open_max_probes: 1,
        request_timeout: Duration::from_millis(250),
    }));
    let store: Arc<dyn RateStore> = Arc::new(ResilientStore::new(backend, breaker.clone()));

    let health = Arc::new(HealthService::new(
        store.clone(),
        Duration::from_secs(config.health.cache_ttl_seconds),
    ));
    let rate_limiter = Arc::new(RateLimitService::new(store.clone(), health.clone()));
    let abuse = Arc::new(AbuseGuard::new(store.clone(), config.abuse.clone()));

    let snapshot = ConfigSnapshot::new(config).expect("test configuration must validate");
    let snapshots = Arc::new(SnapshotHandle::new(snapshot, path));

    AppContext {
        snapshots,
        rate_limiter,
        abuse,
        health,
        store,
        breaker,
        started_at: Instant::now(),
    }
}

/// In-process server over the full router and middleware stack.
pub fn test_server(ctx: AppContext) -> TestServer {
    TestServer::new(create_router(ctx)).expect("failed to start test server")
}

/// Context + server over a fresh in-memory store.
pub fn memory_server(config: Config) -> (AppContext, TestServer) {
    let ctx = build_context(config, Arc::new(MemoryStore::new()));
    let server = test_server(ctx.clone());
    (ctx, server)
}
