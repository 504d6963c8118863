//! Configuration validation module

use crate::config::{AbuseConfig, Config, HealthCacheConfig, ServerConfig, StoreConfig};

/// Trait for validating configuration sections
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Server configuration error: {message}")]
    Server { message: String },

    #[error("Store configuration error: {message}")]
    Store { message: String },

    #[error("Tier configuration error: {message}")]
    Tier { message: String },

    #[error("User configuration error: {message}")]
    User { message: String },

    #[error("Credential configuration error: {message}")]
    Credential { message: String },

    #[error("Abuse configuration error: {message}")]
    Abuse { message: String },

    #[error("Health configuration error: {message}")]
    Health { message: String },
}

impl ValidationError {
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn tier(message: impl Into<String>) -> Self {
        Self::Tier {
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    pub fn abuse(message: impl Into<String>) -> Self {
        Self::Abuse {
            message: message.into(),
        }
    }

    pub fn health(message: impl Into<String>) -> Self {
        Self::Health {
            message: message.into(),
        }
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::server("host must not be empty"));
        }
        if self.port == 0 {
            return Err(ValidationError::server("port must be non-zero"));
        }
        if self.api_key_header.is_empty() {
            return Err(ValidationError::server("api_key_header must not be empty"));
        }
        if self.request_timeout_seconds == 0 {
            return Err(ValidationError::server(
                "request_timeout_seconds must be positive",
            ));
        }
        Ok(())
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::store("host must not be empty"));
        }
        if self.port == 0 {
            return Err(ValidationError::store("port must be non-zero"));
        }
        if self.timeout_ms == 0 {
            return Err(ValidationError::store("timeout_ms must be positive"));
        }
        if self.max_connections == 0 {
            return Err(ValidationError::store("max_connections must be positive"));
        }
        Ok(())
    }
}

impl Validate for AbuseConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::abuse("max_attempts must be positive"));
        }
        if self.attempt_window_seconds == 0 {
            return Err(ValidationError::abuse(
                "attempt_window_seconds must be positive",
            ));
        }
        if self.block_duration_seconds == 0 {
            return Err(ValidationError::abuse(
                "block_duration_seconds must be positive",
            ));
        }
        Ok(())
    }
}

impl Validate for HealthCacheConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        // cache_ttl_seconds of 0 disables the cache, which is legal (used in tests)
        Ok(())
    }
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.store.validate()?;
        self.abuse.validate()?;
        self.health.validate()?;

        if self.tiers.is_empty() {
            return Err(ValidationError::tier("at least one tier must be defined"));
        }

        for (name, tier) in &self.tiers {
            if tier.window_minutes == 0 {
                return Err(ValidationError::tier(format!(
                    "tier {name}: window_minutes must be positive"
                )));
            }
            if tier.burst_limit < tier.base_limit {
                return Err(ValidationError::tier(format!(
                    "tier {name}: burst_limit ({}) must be >= base_limit ({})",
                    tier.burst_limit, tier.base_limit
                )));
            }
            if tier.degraded_limit > tier.base_limit {
                return Err(ValidationError::tier(format!(
                    "tier {name}: degraded_limit ({}) must be <= base_limit ({})",
                    tier.degraded_limit, tier.base_limit
                )));
            }
        }

        for (user_id, tier) in &self.users {
            if !self.tiers.contains_key(tier) {
                return Err(ValidationError::user(format!(
                    "user {user_id} references unknown tier {tier}"
                )));
            }
        }

        for (credential, user_id) in &self.api_keys {
            if !self.users.contains_key(user_id) {
                return Err(ValidationError::credential(format!(
                    "credential {} references unknown user {user_id}",
                    credential_preview(credential)
                )));
            }
            if credential.len() < 8 || credential.len() > 128 {
                return Err(ValidationError::credential(format!(
                    "credential {} must be 8-128 characters",
                    credential_preview(credential)
                )));
            }
            if !credential.chars().all(|c| c.is_ascii_graphic()) {
                return Err(ValidationError::credential(format!(
                    "credential {} contains non-printable characters",
                    credential_preview(credential)
                )));
            }
        }

        Ok(())
    }
}

/// Truncated form of a credential safe to log or report.
pub fn credential_preview(credential: &str) -> String {
    if credential.len() > 8 {
        format!("{}...", &credential[..8])
    } else {
        credential.to_string()
    }
}
