//! Configuration management
//!
//! One structured document describes the whole deployment: tier quotas,
//! the user and credential maps, shared-store connection parameters and
//! the ambient service settings. The file is loaded at startup, validated
//! as a whole and published as an immutable [`ConfigSnapshot`]; reloads
//! replace the snapshot atomically or leave the previous one in force.

pub mod validation;

pub use validation::{Validate, ValidationError, credential_preview};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::health::HealthStatus;
use crate::infrastructure::resilience::CircuitBreakerConfig;

/// Default configuration file path, relative to the working directory.
/// Overridden by the `CONFIG_PATH` environment variable.
pub const DEFAULT_CONFIG_PATH: &str = "config/quotagate.json";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub abuse: AbuseConfig,
    pub health: HealthCacheConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub logging: LoggingConfig,
    /// Credential required on admin routes (`X-Admin-Key`). Admin routes
    /// reject everything when unset.
    pub admin_key: Option<String>,
    /// Tier name -> quota configuration
    pub tiers: HashMap<String, TierConfig>,
    /// User id -> tier name
    pub users: HashMap<String, String>,
    /// Credential -> user id
    pub api_keys: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            abuse: AbuseConfig::default(),
            health: HealthCacheConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            logging: LoggingConfig::default(),
            admin_key: None,
            tiers: HashMap::new(),
            users: HashMap::new(),
            api_keys: HashMap::new(),
        }
    }
}

/// Quota configuration for a single tier, as written in the file.
/// `window_minutes` is normalized to seconds when the snapshot is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Steady-state request quota per window
    pub base_limit: u32,
    /// Quota enforced while system health is NORMAL
    pub burst_limit: u32,
    /// Quota enforced under DEGRADED health for a shedding tier
    pub degraded_limit: u32,
    /// Window length in minutes
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
}

fn default_window_minutes() -> u64 {
    1
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Header carrying the client credential
    pub api_key_header: String,
    /// Paths that bypass rate limiting entirely. A trailing `/*` makes the
    /// entry a prefix match.
    pub exclude_paths: Vec<String>,
    /// Global request timeout applied at the HTTP layer
    pub request_timeout_seconds: u64,
    /// Interval between periodic configuration re-checks; 0 disables them
    pub reload_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key_header: "X-API-Key".to_string(),
            exclude_paths: vec![
                "/health".to_string(),
                "/admin/*".to_string(),
                "/docs".to_string(),
            ],
            request_timeout_seconds: 30,
            reload_interval_seconds: 60,
        }
    }
}

/// Shared-store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Redis-compatible server, required for multi-instance deployments
    #[default]
    Redis,
    /// In-process store for development and tests
    Memory,
}

/// Shared-store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            timeout_ms: 5,
            max_connections: 50,
        }
    }
}

impl StoreConfig {
    /// Build the connection URL for the Redis backend.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Per-call deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Abuse-suppression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Invalid-credential attempts tolerated before a block
    pub max_attempts: u32,
    /// Rolling window over which attempts are counted
    pub attempt_window_seconds: u64,
    /// Duration of a block once triggered
    pub block_duration_seconds: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_window_seconds: 300,
            block_duration_seconds: 900,
        }
    }
}

/// Health-state cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCacheConfig {
    /// In-process cache TTL for health reads
    pub cache_ttl_seconds: u64,
}

impl Default for HealthCacheConfig {
    fn default() -> Self {
        Self { cache_ttl_seconds: 2 }
    }
}

/// Circuit breaker configuration (serializable version)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Cool-down before an open circuit admits a trial probe (seconds)
    pub recovery_timeout_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
        }
    }
}

impl CircuitBreakerSettings {
    /// Convert to the runtime [`CircuitBreakerConfig`]. The per-call
    /// deadline comes from the store configuration.
    pub fn to_circuit_breaker_config(&self, deadline: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_seconds),
            half_open_max_probes: 1,
            request_timeout: deadline,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the path named by `CONFIG_PATH`, falling
    /// back to the default location.
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_path(Path::new(&path))
    }

    /// Load and validate configuration from an explicit file path.
    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(true));

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply the environment variable overrides recognized by the service.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("STORE_HOST") {
            self.store.host = host;
        }
        if let Ok(port) = std::env::var("STORE_PORT")
            && let Ok(port) = port.parse()
        {
            self.store.port = port;
        }
        if let Ok(db) = std::env::var("STORE_DB")
            && let Ok(db) = db.parse()
        {
            self.store.db = db;
        }
        if let Ok(timeout) = std::env::var("STORE_TIMEOUT")
            && let Ok(timeout) = timeout.parse()
        {
            self.store.timeout_ms = timeout;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(admin_key) = std::env::var("ADMIN_KEY") {
            self.admin_key = Some(admin_key);
        }
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration file error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime form of a tier: window normalized to seconds and the effective
/// limit for each health state computed once, selected by enum instead of
/// string-keyed branching on the hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    pub name: String,
    pub base_limit: u32,
    pub burst_limit: u32,
    pub degraded_limit: u32,
    pub window_seconds: u64,
    normal_effective: u32,
    degraded_effective: u32,
}

impl TierPolicy {
    pub fn from_config(name: &str, tier: &TierConfig) -> Self {
        // A tier sheds load under DEGRADED when its degraded quota is
        // strictly below its base quota; paid tiers keep their base quota.
        let degraded_effective = if tier.degraded_limit < tier.base_limit {
            tier.degraded_limit
        } else {
            tier.base_limit
        };

        Self {
            name: name.to_string(),
            base_limit: tier.base_limit,
            burst_limit: tier.burst_limit,
            degraded_limit: tier.degraded_limit,
            window_seconds: tier.window_minutes * 60,
            normal_effective: tier.burst_limit,
            degraded_effective,
        }
    }

    /// The quota actually enforced for this tier under the given health state.
    pub fn effective_limit(&self, health: HealthStatus) -> u32 {
        match health {
            HealthStatus::Normal => self.normal_effective,
            HealthStatus::Degraded => self.degraded_effective,
        }
    }
}

/// Immutable, validated configuration snapshot shared across request
/// handlers. Replaced as a whole; readers never observe a blend.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: Config,
    tiers: HashMap<String, Arc<TierPolicy>>,
}

impl ConfigSnapshot {
    /// Validate a configuration and precompute the tier policies.
    pub fn new(config: Config) -> Result<Self, ValidationError> {
        config.validate()?;

        let tiers = config
            .tiers
            .iter()
            .map(|(name, tier)| (name.clone(), Arc::new(TierPolicy::from_config(name, tier))))
            .collect();

        Ok(Self { config, tiers })
    }

    /// Look up the tier policy for a tier name.
    pub fn tier(&self, name: &str) -> Option<Arc<TierPolicy>> {
        self.tiers.get(name).cloned()
    }

    /// Look up the user id mapped to a credential.
    pub fn credential_user(&self, credential: &str) -> Option<&str> {
        self.config.api_keys.get(credential).map(String::as_str)
    }

    /// Look up the tier name assigned to a user.
    pub fn user_tier(&self, user_id: &str) -> Option<&str> {
        self.config.users.get(user_id).map(String::as_str)
    }
}

/// Shared handle over the current configuration snapshot.
///
/// Readers clone the inner [`Arc`] under a short read lock; writers swap
/// the pointer whole. A failed reload never disturbs the current snapshot.
pub struct SnapshotHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
    /// Path the snapshot was loaded from; admin mutations write back here.
    path: Option<PathBuf>,
}

impl SnapshotHandle {
    pub fn new(snapshot: ConfigSnapshot, path: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            path,
        }
    }

    /// The current snapshot. Cheap; clones a pointer.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().expect("snapshot lock poisoned").clone()
    }

    /// Replace the current snapshot.
    pub fn swap(&self, snapshot: ConfigSnapshot) {
        let mut guard = self.current.write().expect("snapshot lock poisoned");
        *guard = Arc::new(snapshot);
    }

    /// Re-read the configuration file and publish it. On any failure the
    /// prior snapshot stays in force and the error is returned.
    pub fn reload(&self) -> Result<(), ConfigLoadError> {
        let Some(path) = &self.path else {
            return Err(ConfigLoadError::Io(std::io::Error::other(
                "no configuration file path to reload from",
            )));
        };

        let config = Config::from_path(path)?;
        let snapshot = ConfigSnapshot::new(config)?;
        self.swap(snapshot);

        tracing::info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Apply a mutation to a copy of the current configuration, validate
    /// it, persist it to the configuration file and publish the new
    /// snapshot. Mutations are rejected whole on validation failure.
    pub fn mutate_and_persist<F>(&self, mutate: F) -> Result<(), ConfigLoadError>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.current().config.clone();
        mutate(&mut config);

        let snapshot = ConfigSnapshot::new(config)?;

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let serialized = serde_json::to_string_pretty(&snapshot.config)
                .map_err(|e| ConfigLoadError::Io(std::io::Error::other(e)))?;
            std::fs::write(path, serialized)?;
        }

        self.swap(snapshot);
        Ok(())
    }
}

/// Spawn the periodic configuration re-check worker. Respects the
/// cancellation token for graceful shutdown.
pub fn spawn_reload_task(
    handle: Arc<SnapshotHandle>,
    interval_seconds: u64,
    shutdown_token: CancellationToken,
) {
    if interval_seconds == 0 {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        // Skip the immediate first tick; startup already loaded the file.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = handle.reload() {
                        tracing::error!(error = %e, "Periodic configuration reload failed; prior snapshot retained");
                    }
                }
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Configuration reload worker stopped");
                    break;
                }
            }
        }
    });
}
