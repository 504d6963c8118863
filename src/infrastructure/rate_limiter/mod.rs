//! Rate limiting logic and state management

mod service;
mod sliding_window;
mod types;

pub use service::{RateLimitService, UserRateStatus};
pub use sliding_window::SlidingWindowCounter;
pub use types::{
    RateLimitDecision, attempts_key, blocked_key, current_time_millis, current_time_secs,
    event_id, window_key, HEALTH_KEY,
};
