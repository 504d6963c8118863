//! Quotagate - Main application entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

use quotagate::config::{
    Config, ConfigSnapshot, DEFAULT_CONFIG_PATH, SnapshotHandle, spawn_reload_task,
};
use quotagate::infrastructure::abuse::AbuseGuard;
use quotagate::infrastructure::health::HealthService;
use quotagate::infrastructure::rate_limiter::RateLimitService;
use quotagate::infrastructure::resilience::CircuitBreaker;
use quotagate::infrastructure::store::{RateStore, ResilientStore, connect_store};
use quotagate::presentation::{AppContext, create_router};
use quotagate::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load and validate configuration; invalid configuration is fatal here
    // (only reloads retain a prior snapshot).
    let config_path =
        PathBuf::from(std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into()));
    let config = Config::from_path(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from {}: {e}", config_path.display());
        std::process::exit(1);
    });

    init_tracing(&config.logging)?;

    tracing::info!("Starting Quotagate rate limiter");
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        tiers = config.tiers.len(),
        users = config.users.len(),
        api_keys = config.api_keys.len(),
        "Configuration loaded"
    );

    // Shared store behind the per-call deadline and circuit breaker
    let backend = connect_store(&config.store).await;
    let breaker = Arc::new(CircuitBreaker::new(
        config
            .circuit_breaker
            .to_circuit_breaker_config(config.store.deadline()),
    ));
    let store: Arc<dyn RateStore> = Arc::new(ResilientStore::new(backend, breaker.clone()));

    // Core services
    let health = Arc::new(HealthService::new(
        store.clone(),
        std::time::Duration::from_secs(config.health.cache_ttl_seconds),
    ));
    let rate_limiter = Arc::new(RateLimitService::new(store.clone(), health.clone()));
    let abuse = Arc::new(AbuseGuard::new(store.clone(), config.abuse.clone()));

    // Published configuration snapshot + reload machinery
    let reload_interval = config.server.reload_interval_seconds;
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let snapshot = ConfigSnapshot::new(config)?;
    let snapshots = Arc::new(SnapshotHandle::new(snapshot, Some(config_path)));

    let shutdown_token = CancellationToken::new();
    spawn_reload_task(snapshots.clone(), reload_interval, shutdown_token.clone());

    let ctx = AppContext {
        snapshots,
        rate_limiter,
        abuse,
        health,
        store,
        breaker,
        started_at: Instant::now(),
    };

    let app = create_router(ctx);

    tracing::info!("Server listening on {addr}");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_token.cancel();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
