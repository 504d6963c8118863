//! System health service
//!
//! One logical health variable, persisted under a well-known key in the
//! shared store, drives the effective-limit calculation for the whole
//! fleet. Reads go through a short in-process cache with a single-flight
//! refresh; writes propagate through the store and converge on other
//! instances within their own cache TTL.
//!
//! A DEGRADED signal is only honored when observable: on any store
//! failure reads fall back to NORMAL. An unreachable store already fails
//! the rate path open through the circuit breaker, so both paths agree on
//! availability over strict adherence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::infrastructure::rate_limiter::{HEALTH_KEY, current_time_secs};
use crate::infrastructure::store::{RateStore, StoreError};

/// System health states that modulate rate limiting behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "DEGRADED")]
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Normal => "NORMAL",
            HealthStatus::Degraded => "DEGRADED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NORMAL" => Some(HealthStatus::Normal),
            "DEGRADED" => Some(HealthStatus::Degraded),
            _ => None,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current system health with metadata, as stored and as served to admins
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub updated_by: String,
    pub reason: String,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Normal,
            updated_by: "system".to_string(),
            reason: String::new(),
            updated_at: current_time_secs(),
            expires_at: None,
        }
    }
}

impl HealthRecord {
    fn from_fields(fields: &HashMap<String, String>) -> Self {
        // An absent or unparseable record reads as NORMAL; an expired key
        // has already been removed by the store, which reads the same way.
        let status = fields
            .get("status")
            .and_then(|s| HealthStatus::parse(s))
            .unwrap_or(HealthStatus::Normal);

        Self {
            status,
            updated_by: fields
                .get("updated_by")
                .cloned()
                .unwrap_or_else(|| "system".to_string()),
            reason: fields.get("reason").cloned().unwrap_or_default(),
            updated_at: fields
                .get("updated_at")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(current_time_secs),
            expires_at: fields.get("expires_at").and_then(|s| s.parse().ok()),
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("status".to_string(), self.status.as_str().to_string()),
            ("updated_by".to_string(), self.updated_by.clone()),
            ("reason".to_string(), self.reason.clone()),
            ("updated_at".to_string(), self.updated_at.to_string()),
        ];
        if let Some(expires_at) = self.expires_at {
            fields.push(("expires_at".to_string(), expires_at.to_string()));
        }
        fields
    }
}

struct CachedHealth {
    record: HealthRecord,
    fetched_at: Instant,
}

/// Store-backed health service with a short in-process cache.
pub struct HealthService {
    store: Arc<dyn RateStore>,
    cache_ttl: Duration,
    /// Cache guarded by one lock: at most one refresh is in flight per
    /// instance, and concurrent readers within the TTL share the value.
    cache: Mutex<Option<CachedHealth>>,
}

impl HealthService {
    pub fn new(store: Arc<dyn RateStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current health status. Served from cache within the TTL; refreshed
    /// from the store otherwise. Store failures read as NORMAL.
    pub async fn get(&self) -> HealthStatus {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.cache_ttl
        {
            debug!(status = %cached.record.status, "Health cache hit");
            return cached.record.status;
        }

        match self.fetch().await {
            Ok(record) => {
                let status = record.status;
                *cache = Some(CachedHealth {
                    record,
                    fetched_at: Instant::now(),
                });
                debug!(status = %status, "Health status refreshed from store");
                status
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Health status unobservable, assuming NORMAL"
                );
                HealthStatus::Normal
            }
        }
    }

    /// The full health record, freshly read for the admin surface.
    pub async fn record(&self) -> HealthRecord {
        match self.fetch().await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Health record unobservable, serving NORMAL default");
                HealthRecord::default()
            }
        }
    }

    /// Write a new health status to the store and invalidate the local
    /// cache. With `ttl_seconds` the record expires store-side, reverting
    /// the effective status to NORMAL.
    pub async fn set(
        &self,
        status: HealthStatus,
        updated_by: &str,
        reason: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<HealthRecord, StoreError> {
        let now = current_time_secs();
        let record = HealthRecord {
            status,
            updated_by: updated_by.to_string(),
            reason: reason.to_string(),
            updated_at: now,
            expires_at: ttl_seconds.map(|ttl| now + ttl),
        };

        self.store
            .hash_put(
                HEALTH_KEY,
                &record.to_fields(),
                ttl_seconds.map(Duration::from_secs),
            )
            .await?;

        // Local readers must not serve the stale status for another TTL.
        *self.cache.lock().await = None;

        info!(
            status = %status,
            updated_by = updated_by,
            reason = reason,
            ttl_seconds = ?ttl_seconds,
            "System health status updated"
        );

        Ok(record)
    }

    async fn fetch(&self) -> Result<HealthRecord, StoreError> {
        let fields = self.store.hash_get_all(HEALTH_KEY).await?;
        Ok(HealthRecord::from_fields(&fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::{MemoryStore, WindowReply};
    use async_trait::async_trait;

    struct FailingStore;

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
            Err(StoreError::Unavailable)
        }
        async fn window_count(&self, _: &str, _: u64, _: u64) -> Result<u32, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn hash_get_all(&self, _: &str) -> Result<HashMap<String, String>, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn hash_put(
            &self,
            _: &str,
            _: &[(String, String)],
            _: Option<Duration>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn increment_with_expiry(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn flag_set(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn flag_ttl(&self, _: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn ping(&self) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_missing_record_reads_normal() {
        let service = HealthService::new(Arc::new(MemoryStore::new()), Duration::from_secs(2));
        assert_eq!(service.get().await, HealthStatus::Normal);
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let service = HealthService::new(Arc::new(MemoryStore::new()), Duration::from_secs(2));

        service
            .set(HealthStatus::Degraded, "ops", "database overload", None)
            .await
            .unwrap();

        // set() invalidated the cache, so the fresh value is visible at once
        assert_eq!(service.get().await, HealthStatus::Degraded);

        let record = service.record().await;
        assert_eq!(record.status, HealthStatus::Degraded);
        assert_eq!(record.updated_by, "ops");
        assert_eq!(record.reason, "database overload");
        assert!(record.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_reads_within_ttl_are_cached() {
        let store = Arc::new(MemoryStore::new());
        let service = HealthService::new(store.clone(), Duration::from_secs(60));

        assert_eq!(service.get().await, HealthStatus::Normal);

        // Write behind the cache's back: a direct store mutation is not
        // visible until the TTL elapses or the cache is invalidated.
        store
            .hash_put(
                HEALTH_KEY,
                &[("status".to_string(), "DEGRADED".to_string())],
                None,
            )
            .await
            .unwrap();

        assert_eq!(service.get().await, HealthStatus::Normal);
    }

    #[tokio::test]
    async fn test_cache_expiry_picks_up_new_status() {
        let store = Arc::new(MemoryStore::new());
        let service = HealthService::new(store.clone(), Duration::from_millis(20));

        assert_eq!(service.get().await, HealthStatus::Normal);

        store
            .hash_put(
                HEALTH_KEY,
                &[("status".to_string(), "DEGRADED".to_string())],
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(service.get().await, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reverts_to_normal() {
        let service = HealthService::new(Arc::new(MemoryStore::new()), Duration::ZERO);

        let record = service
            .set(HealthStatus::Degraded, "ops", "transient", Some(1))
            .await
            .unwrap();
        assert!(record.expires_at.is_some());
        assert_eq!(service.get().await, HealthStatus::Degraded);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(service.get().await, HealthStatus::Normal);
    }

    #[tokio::test]
    async fn test_store_failure_reads_normal() {
        let service = HealthService::new(Arc::new(FailingStore), Duration::ZERO);
        assert_eq!(service.get().await, HealthStatus::Normal);
        assert_eq!(service.record().await.status, HealthStatus::Normal);
    }

    #[tokio::test]
    async fn test_set_propagates_store_failure() {
        let service = HealthService::new(Arc::new(FailingStore), Duration::ZERO);
        let result = service
            .set(HealthStatus::Degraded, "ops", "test", None)
            .await;
        assert!(result.is_err());
    }
}
