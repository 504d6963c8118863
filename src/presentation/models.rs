//! Request and response models for the HTTP surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Standard error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>, request_id: Uuid) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            request_id,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Body of `POST /admin/health`
#[derive(Debug, Deserialize)]
pub struct SetHealthRequest {
    pub status: String,
    pub ttl_seconds: Option<u64>,
    pub updated_by: Option<String>,
    pub reason: Option<String>,
}

/// Body of `POST /admin/users`
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub user_id: String,
    pub tier: String,
}

/// Body of `POST /admin/api-keys`. Without `api_key` the server generates one.
#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub user_id: String,
    pub api_key: Option<String>,
}

/// Response of `POST /admin/api-keys`
#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub user_id: String,
    pub api_key: String,
}

/// User summary served by the admin user endpoints
#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub user_id: String,
    pub tier: String,
    pub api_key_count: usize,
}

/// Redacted configuration summary for `GET /admin/config`
#[derive(Debug, Serialize)]
pub struct ConfigSummaryResponse {
    pub tier_count: usize,
    pub user_count: usize,
    pub api_key_count: usize,
    pub tiers: HashMap<String, TierSummary>,
    pub store_host: String,
    pub store_port: u16,
}

#[derive(Debug, Serialize)]
pub struct TierSummary {
    pub base_limit: u32,
    pub burst_limit: u32,
    pub degraded_limit: u32,
    pub window_seconds: u64,
}

/// Response of `GET /health`
#[derive(Debug, Serialize)]
pub struct ServiceHealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: HashMap<String, String>,
}
