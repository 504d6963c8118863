//! Rate limiter types, key derivation and clock helpers

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Well-known key of the system health record.
pub const HEALTH_KEY: &str = "health:system";

/// Sliding-window key for one user and window size.
pub fn window_key(user_id: &str, window_seconds: u64) -> String {
    format!("rl:{user_id}:{window_seconds}")
}

/// Invalid-credential attempt counter key for a source address.
pub fn attempts_key(addr: &str) -> String {
    format!("attempts:{addr}")
}

/// Abuse block flag key for a source address.
pub fn blocked_key(addr: &str) -> String {
    format!("blocked:{addr}")
}

/// Request-unique member for the sliding window. Uniqueness keeps two
/// admissions within the same millisecond from colliding in the set.
pub fn event_id(now_ms: u64) -> String {
    format!("{now_ms}:{}", Uuid::new_v4())
}

/// Get current time in milliseconds since Unix epoch
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Get current time in seconds since Unix epoch
pub fn current_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Quota enforced in the current window
    pub limit: u32,
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Unix timestamp when the limit resets
    pub reset_at: u64,
    /// Retry-After duration in seconds (only set when blocked)
    pub retry_after: Option<u64>,
    /// The tier that was applied
    pub tier: String,
    /// True when the store was unreachable and enforcement was skipped
    pub degraded: bool,
}

impl RateLimitDecision {
    /// Create a new allowed result
    pub fn allowed(limit: u32, remaining: u32, reset_at: u64, tier: &str) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
            tier: tier.to_string(),
            degraded: false,
        }
    }

    /// Create a new blocked result
    pub fn blocked(limit: u32, reset_at: u64, tier: &str) -> Self {
        let retry_after = reset_at.saturating_sub(current_time_secs()).max(1);
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after),
            tier: tier.to_string(),
            degraded: false,
        }
    }

    /// Fail-open result used when the shared store is unavailable
    pub fn fail_open(limit: u32, window_seconds: u64, tier: &str) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(1),
            reset_at: current_time_secs() + window_seconds,
            retry_after: None,
            tier: tier.to_string(),
            degraded: true,
        }
    }
}
