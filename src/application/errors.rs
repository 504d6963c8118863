//! Application error taxonomy
//!
//! Each kind carries its response policy: invalid credentials feed the
//! abuse counter and return 401, blocks and exceeded limits return 429,
//! an unavailable store fails open, configuration problems are fatal only
//! at startup, and everything else is a logged 500. No kind is retried
//! silently within a single request.

use crate::application::identity::CredentialError;
use crate::config::ValidationError;
use crate::infrastructure::store::StoreError;

/// Top-level error type for request processing
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid credential: {0}")]
    InvalidCredential(#[from] CredentialError),

    #[error("source address temporarily blocked, retry in {retry_after}s")]
    Blocked { retry_after: u64 },

    #[error("rate limit of {limit} exceeded for tier {tier}")]
    LimitExceeded {
        limit: u32,
        reset_at: u64,
        tier: String,
    },

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(#[from] ValidationError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Machine-readable error code surfaced in response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidCredential(e) => e.code(),
            ApiError::Blocked { .. } => "IP_BLOCKED",
            ApiError::LimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ApiError::ConfigInvalid(_) => "CONFIG_INVALID",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
