//! Sliding-window admission counter
//!
//! Thin façade over [`RateStore::check_window`]: derives the window key,
//! stamps the request with a unique event id and invokes the atomic
//! trim-count-insert-expire operation. Doing all four steps in one
//! server-side operation eliminates check-then-act races between
//! concurrent instances sharing the store.

use std::sync::Arc;

use crate::config::TierPolicy;
use crate::infrastructure::store::{RateStore, StoreError, WindowReply};

use super::types::{current_time_millis, event_id, window_key};

/// Atomic sliding-window counter over the shared store.
pub struct SlidingWindowCounter {
    store: Arc<dyn RateStore>,
}

impl SlidingWindowCounter {
    pub fn new(store: Arc<dyn RateStore>) -> Self {
        Self { store }
    }

    /// Attempt to admit one request for `user_id` under `limit`.
    pub async fn check(
        &self,
        user_id: &str,
        policy: &TierPolicy,
        limit: u32,
    ) -> Result<WindowReply, StoreError> {
        let key = window_key(user_id, policy.window_seconds);
        let now_ms = current_time_millis();
        let event = event_id(now_ms);

        self.store
            .check_window(&key, policy.window_seconds, limit, now_ms, &event)
            .await
    }

    /// Current number of admissions inside the user's window, without
    /// consuming quota.
    pub async fn usage(&self, user_id: &str, policy: &TierPolicy) -> Result<u32, StoreError> {
        let key = window_key(user_id, policy.window_seconds);
        self.store
            .window_count(&key, policy.window_seconds, current_time_millis())
            .await
    }
}
