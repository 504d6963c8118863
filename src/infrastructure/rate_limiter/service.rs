//! Rate limit decision service
//!
//! Combines the tier policy, the cached health state and the atomic
//! sliding-window counter into one admission decision. Store failures on
//! the counter fail open: the request is admitted and the decision is
//! marked degraded so the response can advertise the weakened enforcement.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::TierPolicy;
use crate::infrastructure::health::HealthService;
use crate::infrastructure::store::RateStore;

use super::sliding_window::SlidingWindowCounter;
use super::types::RateLimitDecision;

/// Snapshot of one user's current window, served by the status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserRateStatus {
    pub user_id: String,
    pub tier: String,
    pub system_health: String,
    pub effective_limit: u32,
    pub current_count: u32,
    pub remaining: u32,
    pub window_seconds: u64,
}

/// The decision engine of the hot path.
pub struct RateLimitService {
    counter: SlidingWindowCounter,
    health: Arc<HealthService>,
}

impl RateLimitService {
    pub fn new(store: Arc<dyn RateStore>, health: Arc<HealthService>) -> Self {
        Self {
            counter: SlidingWindowCounter::new(store),
            health,
        }
    }

    /// Decide admission for one request.
    pub async fn check(&self, user_id: &str, policy: &TierPolicy) -> RateLimitDecision {
        let health = self.health.get().await;
        let limit = policy.effective_limit(health);

        match self.counter.check(user_id, policy, limit).await {
            Ok(reply) if reply.allowed => {
                debug!(
                    user_id = user_id,
                    tier = %policy.name,
                    system_health = %health,
                    limit = limit,
                    remaining = reply.remaining,
                    "Request admitted"
                );
                RateLimitDecision::allowed(reply.limit, reply.remaining, reply.reset_at, &policy.name)
            }
            Ok(reply) => {
                info!(
                    user_id = user_id,
                    tier = %policy.name,
                    system_health = %health,
                    limit = limit,
                    reset_at = reply.reset_at,
                    "Rate limit exceeded"
                );
                RateLimitDecision::blocked(reply.limit, reply.reset_at, &policy.name)
            }
            Err(e) => {
                warn!(
                    user_id = user_id,
                    tier = %policy.name,
                    error = %e,
                    "Store unavailable, admitting without enforcement"
                );
                RateLimitDecision::fail_open(limit, policy.window_seconds, &policy.name)
            }
        }
    }

    /// Current window status for a user, without consuming quota.
    pub async fn status(&self, user_id: &str, policy: &TierPolicy) -> UserRateStatus {
        let health = self.health.get().await;
        let effective_limit = policy.effective_limit(health);
        let current_count = self.counter.usage(user_id, policy).await.unwrap_or(0);

        UserRateStatus {
            user_id: user_id.to_string(),
            tier: policy.name.clone(),
            system_health: health.as_str().to_string(),
            effective_limit,
            current_count,
            remaining: effective_limit.saturating_sub(current_count),
            window_seconds: policy.window_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use crate::infrastructure::health::HealthStatus;
    use crate::infrastructure::store::MemoryStore;
    use std::time::Duration;

    fn free_policy() -> TierPolicy {
        TierPolicy::from_config(
            "free",
            &TierConfig {
                base_limit: 10,
                burst_limit: 20,
                degraded_limit: 2,
                window_minutes: 1,
            },
        )
    }

    fn service_with_store(store: Arc<dyn RateStore>) -> (RateLimitService, Arc<HealthService>) {
        let health = Arc::new(HealthService::new(store.clone(), Duration::ZERO));
        (RateLimitService::new(store, health.clone()), health)
    }

    #[tokio::test]
    async fn test_normal_health_enforces_burst_limit() {
        let store: Arc<dyn RateStore> = Arc::new(MemoryStore::new());
        let (service, _) = service_with_store(store);
        let policy = free_policy();

        for _ in 0..20 {
            let decision = service.check("demo_free_user", &policy).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 20);
        }

        let decision = service.check("demo_free_user", &policy).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 20);
        assert!(decision.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_degraded_health_sheds_free_tier() {
        let store: Arc<dyn RateStore> = Arc::new(MemoryStore::new());
        let (service, health) = service_with_store(store);
        let policy = free_policy();

        health
            .set(HealthStatus::Degraded, "test", "load shedding", None)
            .await
            .unwrap();

        for _ in 0..2 {
            let decision = service.check("demo_free_user", &policy).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 2);
        }

        let decision = service.check("demo_free_user", &policy).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 2);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_with_degraded_marker() {
        use crate::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};
        use crate::infrastructure::store::ResilientStore;

        struct DeadStore;

        #[async_trait::async_trait]
        impl RateStore for DeadStore {
            async fn check_window(
                &self,
                _: &str,
                _: u64,
                _: u32,
                _: u64,
                _: &str,
            ) -> Result<crate::infrastructure::store::WindowReply, crate::infrastructure::store::StoreError>
            {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn window_count(
                &self,
                _: &str,
                _: u64,
                _: u64,
            ) -> Result<u32, crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn hash_get_all(
                &self,
                _: &str,
            ) -> Result<std::collections::HashMap<String, String>, crate::infrastructure::store::StoreError>
            {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn hash_put(
                &self,
                _: &str,
                _: &[(String, String)],
                _: Option<Duration>,
            ) -> Result<(), crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn increment_with_expiry(
                &self,
                _: &str,
                _: Duration,
            ) -> Result<i64, crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn flag_set(
                &self,
                _: &str,
                _: Duration,
            ) -> Result<(), crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn flag_ttl(
                &self,
                _: &str,
            ) -> Result<Option<u64>, crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn delete(&self, _: &str) -> Result<(), crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
            async fn ping(&self) -> Result<bool, crate::infrastructure::store::StoreError> {
                Err(crate::infrastructure::store::StoreError::Connection(
                    "refused".into(),
                ))
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
            request_timeout: Duration::from_millis(50),
        }));
        let store: Arc<dyn RateStore> =
            Arc::new(ResilientStore::new(Arc::new(DeadStore), breaker));
        let (service, _) = service_with_store(store);
        let policy = free_policy();

        // Every request completes and is admitted, marked degraded
        for _ in 0..5 {
            let decision = service.check("demo_free_user", &policy).await;
            assert!(decision.allowed);
            assert!(decision.degraded);
        }
    }

    #[tokio::test]
    async fn test_status_reports_current_window() {
        let store: Arc<dyn RateStore> = Arc::new(MemoryStore::new());
        let (service, _) = service_with_store(store);
        let policy = free_policy();

        service.check("demo_free_user", &policy).await;
        service.check("demo_free_user", &policy).await;

        let status = service.status("demo_free_user", &policy).await;
        assert_eq!(status.current_count, 2);
        assert_eq!(status.effective_limit, 20);
        assert_eq!(status.remaining, 18);
        assert_eq!(status.system_health, "NORMAL");
        assert_eq!(status.window_seconds, 60);
    }
}
