//! Structured logging with tracing

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging for the service.
///
/// The filter is taken from the `LOG_LEVEL` environment variable when set,
/// otherwise from the configuration. The `format` option selects between
/// JSON output (production) and human-readable output (development).
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()?;
    }

    Ok(())
}
