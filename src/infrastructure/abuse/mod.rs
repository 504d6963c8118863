//! Abuse suppression for invalid credentials
//!
//! Counts invalid-credential events per source address and escalates to a
//! temporary block, isolating credential-scan abuse from legitimate user
//! quotas. State lives in the shared store so a scan spread across the
//! fleet still trips the block.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AbuseConfig;
use crate::infrastructure::rate_limiter::{attempts_key, blocked_key};
use crate::infrastructure::store::RateStore;

/// Outcome of recording one invalid-credential attempt
#[derive(Debug, Clone, Copy)]
pub struct AttemptOutcome {
    /// Attempts observed within the rolling window, including this one
    pub attempts: i64,
    /// True when this attempt triggered a block
    pub blocked: bool,
}

/// Per-source-address abuse guard.
pub struct AbuseGuard {
    store: Arc<dyn RateStore>,
    config: AbuseConfig,
}

impl AbuseGuard {
    pub fn new(store: Arc<dyn RateStore>, config: AbuseConfig) -> Self {
        Self { store, config }
    }

    /// Whether the address is currently blocked, and for how many more
    /// seconds. Store failures fail open: an unobservable block does not
    /// reject traffic.
    pub async fn check_blocked(&self, addr: &str) -> Option<u64> {
        match self.store.flag_ttl(&blocked_key(addr)).await {
            Ok(Some(remaining)) => Some(remaining.max(1)),
            Ok(None) => None,
            Err(e) => {
                warn!(addr = addr, error = %e, "Block check failed, failing open");
                None
            }
        }
    }

    /// Record one invalid-credential event for the address, escalating to
    /// a block at the configured threshold.
    pub async fn record_invalid_attempt(&self, addr: &str) -> AttemptOutcome {
        let attempts = match self
            .store
            .increment_with_expiry(
                &attempts_key(addr),
                Duration::from_secs(self.config.attempt_window_seconds),
            )
            .await
        {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(addr = addr, error = %e, "Attempt counter unavailable, failing open");
                return AttemptOutcome {
                    attempts: 0,
                    blocked: false,
                };
            }
        };

        debug!(
            addr = addr,
            attempts = attempts,
            max_attempts = self.config.max_attempts,
            "Recorded invalid credential attempt"
        );

        if attempts >= self.config.max_attempts as i64 {
            let duration = Duration::from_secs(self.config.block_duration_seconds);
            match self.store.flag_set(&blocked_key(addr), duration).await {
                Ok(()) => {
                    warn!(
                        security_alert = true,
                        addr = addr,
                        attempts = attempts,
                        block_duration_seconds = self.config.block_duration_seconds,
                        "Source address blocked after repeated invalid credentials"
                    );
                    return AttemptOutcome {
                        attempts,
                        blocked: true,
                    };
                }
                Err(e) => {
                    warn!(addr = addr, error = %e, "Failed to set block flag");
                }
            }
        }

        AttemptOutcome {
            attempts,
            blocked: false,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::MemoryStore;

    fn guard(max_attempts: u32) -> AbuseGuard {
        AbuseGuard::new(
            Arc::new(MemoryStore::new()),
            AbuseConfig {
                max_attempts,
                attempt_window_seconds: 300,
                block_duration_seconds: 900,
            },
        )
    }

    #[tokio::test]
    async fn test_attempts_below_threshold_do_not_block() {
        let guard = guard(10);

        for i in 1..=9 {
            let outcome = guard.record_invalid_attempt("10.0.0.1").await;
            assert_eq!(outcome.attempts, i);
            assert!(!outcome.blocked);
        }

        assert!(guard.check_blocked("10.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_threshold_attempt_triggers_block() {
        let guard = guard(10);

        for _ in 1..=9 {
            guard.record_invalid_attempt("10.0.0.1").await;
        }
        let outcome = guard.record_invalid_attempt("10.0.0.1").await;
        assert!(outcome.blocked);
        assert_eq!(outcome.attempts, 10);

        let remaining = guard.check_blocked("10.0.0.1").await.unwrap();
        assert!(remaining > 890 && remaining <= 900);
    }

    #[tokio::test]
    async fn test_addresses_are_isolated() {
        let guard = guard(2);

        guard.record_invalid_attempt("10.0.0.1").await;
        guard.record_invalid_attempt("10.0.0.1").await;

        assert!(guard.check_blocked("10.0.0.1").await.is_some());
        assert!(guard.check_blocked("10.0.0.2").await.is_none());
    }
}
