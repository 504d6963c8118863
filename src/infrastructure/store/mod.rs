//! Shared-store client
//!
//! Storage backends for rate limiting state:
//! - Redis (or any Redis-compatible server) for distributed, production use
//! - In-memory for development and single-instance deployments
//!
//! Production deployments wrap the backend in [`ResilientStore`], which adds
//! the per-call deadline and the circuit breaker so that a slow or dead
//! store degrades enforcement instead of taking request handling down.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::StoreConfig;
use crate::infrastructure::resilience::CircuitBreaker;

/// Error type for shared-store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Circuit is open; the call was rejected without touching the store.
    /// Callers fail open on the rate path and assume NORMAL on the health path.
    #[error("shared store unavailable (circuit open)")]
    Unavailable,

    #[error("store call exceeded {0:?} deadline")]
    Timeout(Duration),

    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store script error: {0}")]
    Script(String),

    #[error("store reply decode error: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Connection(e.to_string())
    }
}

/// Result of one sliding-window admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReply {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) when the oldest counted event leaves the window
    pub reset_at: u64,
}

/// Abstract storage interface for the decision engine.
///
/// The trait is deliberately shaped around the engine's operations rather
/// than raw store commands, so the in-memory backend can honor the same
/// atomicity guarantees the server-side script provides.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Atomically trim, count and (when under `limit`) admit one event into
    /// the sliding window at `key`. The entire operation is a single
    /// serialization point per key.
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u32,
        now_ms: u64,
        event_id: &str,
    ) -> Result<WindowReply, StoreError>;

    /// Count events currently inside the window without admitting anything.
    async fn window_count(
        &self,
        key: &str,
        window_seconds: u64,
        now_ms: u64,
    ) -> Result<u32, StoreError>;

    /// Read all fields of a hash record. Missing key yields an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Replace fields of a hash record, applying `ttl` to the key when
    /// given and clearing any prior expiry otherwise.
    async fn hash_put(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Increment a counter, starting its TTL when the increment creates it.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Set a flag key with a TTL.
    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remaining TTL of a flag key in seconds; `None` when the key is absent.
    async fn flag_ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<bool, StoreError>;
}

/// Server-side sliding-window-log admission script.
///
/// KEYS[1] window key, ARGV[1] window seconds, ARGV[2] limit,
/// ARGV[3] now in ms, ARGV[4] event id. Returns
/// {allowed, limit, remaining, reset_at}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local event_id = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window * 1000)
local used = redis.call('ZCARD', key)

local allowed = 0
local remaining = 0
if used < limit then
    redis.call('ZADD', key, now_ms, event_id)
    allowed = 1
    remaining = limit - used - 1
end

redis.call('EXPIRE', key, window + 1)

local reset_at
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    reset_at = math.floor(tonumber(oldest[2]) / 1000) + window
else
    reset_at = math.floor(now_ms / 1000) + window
end

return {allowed, limit, remaining, reset_at}
"#;

/// Redis-backed shared store
pub struct RedisStore {
    connection_manager: ConnectionManager,
    window_script: redis::Script,
}

impl RedisStore {
    /// Connect to the store and verify the connection with a ping.
    ///
    /// The window script is registered by hash; a server that lost its
    /// script cache (`NOSCRIPT`) gets one transparent re-upload per call.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.url();
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            error!(host = %config.host, port = config.port, "Failed to create store client: {}", e);
            StoreError::Connection(e.to_string())
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!(host = %config.host, port = config.port, "Failed to establish store connection: {}", e);
            StoreError::Connection(e.to_string())
        })?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to ping store: {}", e);
                StoreError::Connection(e.to_string())
            })?;

        debug!(host = %config.host, port = config.port, db = config.db, "Connected to shared store");

        Ok(Self {
            connection_manager,
            window_script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl RateStore for RedisStore {
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u32,
        now_ms: u64,
        event_id: &str,
    ) -> Result<WindowReply, StoreError> {
        let mut conn = self.connection_manager.clone();

        let (allowed, limit, remaining, reset_at): (i64, i64, i64, i64) = self
            .window_script
            .key(key)
            .arg(window_seconds)
            .arg(limit)
            .arg(now_ms)
            .arg(event_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Script(e.to_string()))?;

        Ok(WindowReply {
            allowed: allowed == 1,
            limit: limit as u32,
            remaining: remaining.max(0) as u32,
            reset_at: reset_at.max(0) as u64,
        })
    }

    async fn window_count(
        &self,
        key: &str,
        window_seconds: u64,
        now_ms: u64,
    ) -> Result<u32, StoreError> {
        let mut conn = self.connection_manager.clone();
        let floor = now_ms.saturating_sub(window_seconds * 1000);

        let count: i64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({floor}"))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        Ok(count.max(0) as u32)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection_manager.clone();

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        Ok(fields)
    }

    async fn hash_put(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(key).ignore();
        {
            let hset = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                hset.arg(field).arg(value);
            }
            hset.ignore();
        }
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
        }

        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection_manager.clone();

        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs())
                .query_async::<i64>(&mut conn)
                .await?;
        }

        Ok(count)
    }

    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();

        redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<String>(&mut conn)
            .await?;

        Ok(())
    }

    async fn flag_ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection_manager.clone();

        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        // -2: no such key; -1: key without expiry (treated as just set)
        Ok(match ttl {
            -2 => None,
            ttl => Some(ttl.max(0) as u64),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply == "PONG")
    }
}

#[derive(Default)]
struct MemoryInner {
    /// Window key -> (event timestamps ms + ids, key expiry ms)
    windows: HashMap<String, (Vec<(u64, String)>, u64)>,
    /// Hash key -> (fields, optional expiry ms)
    hashes: HashMap<String, (HashMap<String, String>, Option<u64>)>,
    /// Counter key -> (value, expiry ms)
    counters: HashMap<String, (i64, u64)>,
    /// Flag key -> expiry ms
    flags: HashMap<String, u64>,
}

/// In-memory store for development and single-instance deployments.
///
/// One mutex serializes all operations, which makes `check_window` exactly
/// as atomic as the server-side script.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn clock_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u32,
        now_ms: u64,
        event_id: &str,
    ) -> Result<WindowReply, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");

        let (events, expiry) = inner
            .windows
            .entry(key.to_string())
            .or_insert_with(|| (Vec::new(), 0));

        let floor = now_ms.saturating_sub(window_seconds * 1000);
        events.retain(|(ts, _)| *ts > floor);

        let used = events.len() as u32;
        let (allowed, remaining) = if used < limit {
            events.push((now_ms, event_id.to_string()));
            (true, limit - used - 1)
        } else {
            (false, 0)
        };

        *expiry = now_ms + (window_seconds + 1) * 1000;

        let reset_at = events
            .iter()
            .map(|(ts, _)| ts / 1000 + window_seconds)
            .min()
            .unwrap_or(now_ms / 1000 + window_seconds);

        Ok(WindowReply {
            allowed,
            limit,
            remaining,
            reset_at,
        })
    }

    async fn window_count(
        &self,
        key: &str,
        window_seconds: u64,
        now_ms: u64,
    ) -> Result<u32, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let floor = now_ms.saturating_sub(window_seconds * 1000);

        Ok(inner
            .windows
            .get(key)
            .map(|(events, _)| events.iter().filter(|(ts, _)| *ts > floor).count() as u32)
            .unwrap_or(0))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let now = Self::clock_ms();

        let expired = matches!(inner.hashes.get(key), Some((_, Some(expiry))) if *expiry <= now);
        if expired {
            inner.hashes.remove(key);
        }

        Ok(inner
            .hashes
            .get(key)
            .map(|(fields, _)| fields.clone())
            .unwrap_or_default())
    }

    async fn hash_put(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let expiry = ttl.map(|ttl| Self::clock_ms() + ttl.as_millis() as u64);
        inner
            .hashes
            .insert(key.to_string(), (fields.iter().cloned().collect(), expiry));
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let now = Self::clock_ms();

        let expired = matches!(inner.counters.get(key), Some((_, expiry)) if *expiry <= now);
        if expired {
            inner.counters.remove(key);
        }

        let entry = inner
            .counters
            .entry(key.to_string())
            .or_insert_with(|| (0, now + ttl.as_millis() as u64));
        entry.0 += 1;

        Ok(entry.0)
    }

    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner
            .flags
            .insert(key.to_string(), Self::clock_ms() + ttl.as_millis() as u64);
        Ok(())
    }

    async fn flag_ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let now = Self::clock_ms();

        match inner.flags.get(key).copied() {
            Some(expiry) if expiry > now => Ok(Some((expiry - now).div_ceil(1000))),
            Some(_) => {
                inner.flags.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.windows.remove(key);
        inner.hashes.remove(key);
        inner.counters.remove(key);
        inner.flags.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        Ok(true)
    }
}

/// Decorator adding the per-call deadline and circuit breaker to a backend.
///
/// When the circuit is open every call fails immediately with
/// [`StoreError::Unavailable`] and the wrapped backend is never touched.
pub struct ResilientStore {
    inner: Arc<dyn RateStore>,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn RateStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl RateStore for ResilientStore {
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u32,
        now_ms: u64,
        event_id: &str,
    ) -> Result<WindowReply, StoreError> {
        self.breaker
            .execute(|| {
                self.inner
                    .check_window(key, window_seconds, limit, now_ms, event_id)
            })
            .await
    }

    async fn window_count(
        &self,
        key: &str,
        window_seconds: u64,
        now_ms: u64,
    ) -> Result<u32, StoreError> {
        self.breaker
            .execute(|| self.inner.window_count(key, window_seconds, now_ms))
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.breaker.execute(|| self.inner.hash_get_all(key)).await
    }

    async fn hash_put(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.breaker
            .execute(|| self.inner.hash_put(key, fields, ttl))
            .await
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.breaker
            .execute(|| self.inner.increment_with_expiry(key, ttl))
            .await
    }

    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.breaker.execute(|| self.inner.flag_set(key, ttl)).await
    }

    async fn flag_ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.breaker.execute(|| self.inner.flag_ttl(key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.breaker.execute(|| self.inner.delete(key)).await
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        self.breaker.execute(|| self.inner.ping()).await
    }
}

/// Build the configured store backend. A Redis backend that cannot be
/// reached at startup degrades to the in-memory backend with a warning so
/// a single instance keeps enforcing limits locally.
pub async fn connect_store(config: &StoreConfig) -> Arc<dyn RateStore> {
    match config.backend {
        crate::config::StoreBackend::Redis => match RedisStore::connect(config).await {
            Ok(store) => {
                tracing::info!(url = %config.url(), "Using Redis shared-store backend");
                Arc::new(store)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Failed to connect to shared store, falling back to in-memory backend"
                );
                Arc::new(MemoryStore::new())
            }
        },
        crate::config::StoreBackend::Memory => {
            tracing::info!("Using in-memory store backend");
            Arc::new(MemoryStore::new())
        }
    }
}
