//! Admin handlers
//!
//! Thin HTTP surface over the health and user services. Every route
//! requires the configured admin key in `X-Admin-Key`; with no admin key
//! configured the whole surface is disabled. User and credential
//! mutations persist through the configuration file write-back path, so
//! reload semantics hold for them as for any other configuration change.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::config::ConfigLoadError;
use crate::infrastructure::health::HealthStatus;
use crate::infrastructure::rate_limiter::current_time_secs;

use super::AppContext;
use super::models::{
    ConfigSummaryResponse, CreateApiKeyRequest, CreateApiKeyResponse, CreateUserRequest,
    ErrorResponse, SetHealthRequest, TierSummary, UserInfoResponse,
};

/// Verify the admin credential. Admin routes are disabled entirely when
/// no admin key is configured.
fn require_admin(ctx: &AppContext, headers: &HeaderMap) -> Result<(), Response> {
    let snapshot = ctx.snapshots.current();

    let Some(expected) = snapshot.config.admin_key.clone() else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "ADMIN_DISABLED",
            "Admin interface is disabled; no admin key configured.",
        ));
    };

    let presented = headers.get("x-admin-key").and_then(|h| h.to_str().ok());
    if presented != Some(expected.as_str()) {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "ADMIN_UNAUTHORIZED",
            "Invalid or missing admin key.",
        ));
    }

    Ok(())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse::new(code, message, Uuid::new_v4())),
    )
        .into_response()
}

fn mutation_error(e: ConfigLoadError) -> Response {
    match e {
        ConfigLoadError::Validation(e) => {
            error_response(StatusCode::BAD_REQUEST, "CONFIG_INVALID", &e.to_string())
        }
        e => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CONFIG_WRITE_FAILED",
            &e.to_string(),
        ),
    }
}

/// `GET /admin/health`
pub async fn get_system_health(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;
    let record = ctx.health.record().await;
    Ok(Json(record).into_response())
}

/// `POST /admin/health`
pub async fn set_system_health(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(body): Json<SetHealthRequest>,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    let Some(status) = HealthStatus::parse(&body.status) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_HEALTH_STATUS",
            "status must be NORMAL or DEGRADED",
        ));
    };

    let record = ctx
        .health
        .set(
            status,
            body.updated_by.as_deref().unwrap_or("admin"),
            body.reason.as_deref().unwrap_or(""),
            body.ttl_seconds,
        )
        .await
        .map_err(|e| {
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                &e.to_string(),
            )
        })?;

    Ok(Json(record).into_response())
}

/// `GET /admin/users`
pub async fn list_users(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    let snapshot = ctx.snapshots.current();
    let mut users: Vec<UserInfoResponse> = snapshot
        .config
        .users
        .iter()
        .map(|(user_id, tier)| UserInfoResponse {
            user_id: user_id.clone(),
            tier: tier.clone(),
            api_key_count: snapshot
                .config
                .api_keys
                .values()
                .filter(|owner| *owner == user_id)
                .count(),
        })
        .collect();
    users.sort_by(|a, b| a.user_id.cmp(&b.user_id));

    Ok(Json(users).into_response())
}

/// `POST /admin/users`
pub async fn create_user(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(body): Json<CreateUserRequest>,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    if ctx.snapshots.current().user_tier(&body.user_id).is_some() {
        return Err(error_response(
            StatusCode::CONFLICT,
            "USER_EXISTS",
            "User already exists.",
        ));
    }

    ctx.snapshots
        .mutate_and_persist(|config| {
            config.users.insert(body.user_id.clone(), body.tier.clone());
        })
        .map_err(mutation_error)?;

    tracing::info!(user_id = %body.user_id, tier = %body.tier, "User created");

    Ok((
        StatusCode::CREATED,
        Json(UserInfoResponse {
            user_id: body.user_id,
            tier: body.tier,
            api_key_count: 0,
        }),
    )
        .into_response())
}

/// `GET /admin/users/{user_id}`
pub async fn get_user(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    let snapshot = ctx.snapshots.current();
    let Some(tier) = snapshot.user_tier(&user_id) else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "USER_NOT_FOUND",
            "No such user.",
        ));
    };

    Ok(Json(UserInfoResponse {
        user_id: user_id.clone(),
        tier: tier.to_string(),
        api_key_count: snapshot
            .config
            .api_keys
            .values()
            .filter(|owner| **owner == user_id)
            .count(),
    })
    .into_response())
}

/// `POST /admin/api-keys`
pub async fn create_api_key(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    let snapshot = ctx.snapshots.current();
    let Some(tier) = snapshot.user_tier(&body.user_id) else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "USER_NOT_FOUND",
            "Cannot issue a credential for an unknown user.",
        ));
    };

    let api_key = body.api_key.unwrap_or_else(|| {
        format!(
            "{}_{}_{}_{}",
            tier,
            body.user_id,
            current_time_secs(),
            Uuid::new_v4().simple()
        )
    });

    if snapshot.credential_user(&api_key).is_some() {
        return Err(error_response(
            StatusCode::CONFLICT,
            "API_KEY_EXISTS",
            "Credential already exists.",
        ));
    }

    ctx.snapshots
        .mutate_and_persist(|config| {
            config
                .api_keys
                .insert(api_key.clone(), body.user_id.clone());
        })
        .map_err(mutation_error)?;

    tracing::info!(user_id = %body.user_id, "API key issued");

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            user_id: body.user_id,
            api_key,
        }),
    )
        .into_response())
}

/// `GET /admin/limits/{user_id}`
pub async fn get_user_limits(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    let snapshot = ctx.snapshots.current();
    let policy = snapshot
        .user_tier(&user_id)
        .and_then(|tier| snapshot.tier(tier));
    let Some(policy) = policy else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "USER_NOT_FOUND",
            "No such user.",
        ));
    };

    let status = ctx.rate_limiter.status(&user_id, &policy).await;
    Ok(Json(status).into_response())
}

/// `GET /admin/config`
pub async fn get_config(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    let snapshot = ctx.snapshots.current();
    let tiers = snapshot
        .config
        .tiers
        .iter()
        .map(|(name, tier)| {
            (
                name.clone(),
                TierSummary {
                    base_limit: tier.base_limit,
                    burst_limit: tier.burst_limit,
                    degraded_limit: tier.degraded_limit,
                    window_seconds: tier.window_minutes * 60,
                },
            )
        })
        .collect();

    Ok(Json(ConfigSummaryResponse {
        tier_count: snapshot.config.tiers.len(),
        user_count: snapshot.config.users.len(),
        api_key_count: snapshot.config.api_keys.len(),
        tiers,
        store_host: snapshot.config.store.host.clone(),
        store_port: snapshot.config.store.port,
    })
    .into_response())
}

/// `POST /admin/config/reload`
pub async fn reload_config(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_admin(&ctx, &headers)?;

    match ctx.snapshots.reload() {
        Ok(()) => Ok(Json(serde_json::json!({ "reloaded": true })).into_response()),
        Err(e) => {
            tracing::error!(error = %e, "Admin-triggered reload failed; prior snapshot retained");
            Err(error_response(
                StatusCode::BAD_REQUEST,
                "CONFIG_RELOAD_FAILED",
                &e.to_string(),
            ))
        }
    }
}
