//! Route definitions and router setup

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Extension, Json, Router, middleware,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::application::identity::Identity;
use crate::infrastructure::resilience::CircuitState;

use super::middleware::rate_limit_middleware;
use super::models::{ErrorResponse, ServiceHealthResponse};
use super::{AppContext, admin};

/// Create the application router with the full middleware stack.
pub fn create_router(ctx: AppContext) -> Router {
    let request_timeout = ctx
        .snapshots
        .current()
        .config
        .server
        .request_timeout_seconds;

    let admin_routes = Router::new()
        .route("/health", get(admin::get_system_health).post(admin::set_system_health))
        .route("/users", get(admin::list_users).post(admin::create_user))
        .route("/users/{user_id}", get(admin::get_user))
        .route("/api-keys", post(admin::create_api_key))
        .route("/limits/{user_id}", get(admin::get_user_limits))
        .route("/config", get(admin::get_config))
        .route("/config/reload", post(admin::reload_config));

    let api_routes = Router::new().route("/limits", get(my_limits));

    Router::new()
        .route("/health", get(service_health))
        .nest("/admin", admin_routes)
        .nest("/api/v1", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(request_timeout)))
                .layer(middleware::from_fn_with_state(
                    ctx.clone(),
                    rate_limit_middleware,
                )),
        )
        .with_state(ctx)
}

/// `GET /health`: service liveness with component detail. Allowlisted
/// from rate limiting so orchestrators can always probe it.
async fn service_health(State(ctx): State<AppContext>) -> Response {
    let mut components = HashMap::new();
    let mut healthy = true;

    match ctx.store.ping().await {
        Ok(true) => {
            components.insert("store".to_string(), "healthy".to_string());
        }
        Ok(false) | Err(_) => {
            components.insert("store".to_string(), "unhealthy".to_string());
            healthy = false;
        }
    }

    let breaker_state = ctx.breaker.state().await;
    components.insert("circuit_breaker".to_string(), breaker_state.as_str().to_string());
    if breaker_state == CircuitState::Open {
        healthy = false;
    }

    components.insert(
        "system_health".to_string(),
        ctx.health.get().await.as_str().to_string(),
    );

    let snapshot = ctx.snapshots.current();
    components.insert(
        "config".to_string(),
        format!("{} tiers", snapshot.config.tiers.len()),
    );

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(ServiceHealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: Utc::now(),
            uptime_seconds: ctx.started_at.elapsed().as_secs(),
            components,
        }),
    )
        .into_response()
}

/// `GET /api/v1/limits`: the calling user's current window status.
/// Passes through the rate limiting middleware like any other API route,
/// so it consumes quota and carries the rate headers.
async fn my_limits(
    State(ctx): State<AppContext>,
    identity: Option<Extension<Identity>>,
) -> Response {
    let Some(Extension(identity)) = identity else {
        // Unreachable through the middleware; defends against route misuse.
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(
                "INTERNAL_ERROR",
                "Request reached handler without a resolved identity",
                Uuid::new_v4(),
            )),
        )
            .into_response();
    };

    let status = ctx
        .rate_limiter
        .status(&identity.user_id, &identity.tier)
        .await;

    Json(status).into_response()
}
