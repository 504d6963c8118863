//! Rate limiting middleware
//!
//! The orchestrator of the hot path. For each request it short-circuits
//! allowlisted paths, checks the abuse block, resolves the credential,
//! reads the cached health state, computes the effective limit, invokes
//! the atomic window counter and annotates the response. A store outage
//! admits the request with degraded-enforcement marking instead of
//! failing it.

use std::time::Instant;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::application::errors::ApiError;
use crate::application::identity;
use crate::infrastructure::rate_limiter::{RateLimitDecision, current_time_secs};

use super::AppContext;
use super::models::ErrorResponse;

/// Request id generated by the middleware, available to handlers.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Convert an [`ApiError`] to its HTTP response.
pub fn api_error_to_response(error: &ApiError, request_id: Uuid) -> Response {
    let (status, body) = match error {
        ApiError::InvalidCredential(e) => (
            StatusCode::UNAUTHORIZED,
            ErrorResponse::new(e.code(), e.to_string(), request_id),
        ),
        ApiError::Blocked { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            ErrorResponse::new(
                "IP_BLOCKED",
                "Too many invalid API key attempts. Address temporarily blocked.",
                request_id,
            )
            .with_details(serde_json::json!({ "retry_after": retry_after })),
        ),
        ApiError::LimitExceeded { limit, reset_at, tier } => {
            let retry_after = reset_at.saturating_sub(current_time_secs()).max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::new(
                    "RATE_LIMIT_EXCEEDED",
                    format!("Rate limit of {limit} requests per window exceeded."),
                    request_id,
                )
                .with_details(serde_json::json!({
                    "tier": tier,
                    "limit": limit,
                    "retry_after": retry_after,
                })),
            )
        }
        ApiError::StoreUnavailable(_) | ApiError::ConfigInvalid(_) | ApiError::Internal(_) => {
            tracing::error!(
                request_id = %request_id,
                error = %error,
                error_code = error.code(),
                "Unexpected error mapped to HTTP response"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(error.code(), "Internal server error", request_id),
            )
        }
    };

    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    put_request_id(headers, request_id);

    match error {
        ApiError::Blocked { retry_after } => {
            put_numeric(headers, "retry-after", *retry_after);
        }
        ApiError::LimitExceeded { limit, reset_at, .. } => {
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            put_numeric(headers, "x-ratelimit-reset", *reset_at);
            put_numeric(
                headers,
                "retry-after",
                reset_at.saturating_sub(current_time_secs()).max(1),
            );
        }
        _ => {}
    }

    response
}

/// Check whether a path bypasses rate limiting. Entries match exactly;
/// a trailing `/*` makes the entry match the prefix and everything below.
pub fn should_exclude(path: &str, exclude_paths: &[String]) -> bool {
    let normalized = normalize(path);

    for excluded in exclude_paths {
        if let Some(prefix) = excluded.strip_suffix("/*") {
            let prefix = normalize(prefix);
            if normalized == prefix || normalized.starts_with(&format!("{prefix}/")) {
                return true;
            }
        } else if normalized == normalize(excluded) {
            return true;
        }
    }

    false
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extract the client address, preferring proxy-forwarded headers.
pub fn client_addr(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let snapshot = ctx.snapshots.current();

    if should_exclude(&path, &snapshot.config.server.exclude_paths) {
        tracing::debug!(request_id = %request_id, path = %path, "Path excluded from rate limiting");
        return next.run(request).await;
    }

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "Processing request"
    );

    let addr = client_addr(request.headers());

    if let Some(retry_after) = ctx.abuse.check_blocked(&addr).await {
        tracing::warn!(
            request_id = %request_id,
            addr = %addr,
            retry_after = retry_after,
            "Blocked address attempted access"
        );
        return api_error_to_response(&ApiError::Blocked { retry_after }, request_id);
    }

    let credential = request
        .headers()
        .get(snapshot.config.server.api_key_header.as_str())
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let identity = match identity::resolve(&snapshot, credential.as_deref()) {
        Ok(identity) => identity,
        Err(error) => {
            tracing::warn!(
                request_id = %request_id,
                addr = %addr,
                error_code = error.code(),
                "Credential validation failed"
            );
            // A block tripped by this attempt applies from the next
            // request on; this one still gets the credential error.
            ctx.abuse.record_invalid_attempt(&addr).await;
            return api_error_to_response(&ApiError::InvalidCredential(error), request_id);
        }
    };

    let decision = ctx
        .rate_limiter
        .check(&identity.user_id, &identity.tier)
        .await;

    if !decision.allowed {
        return api_error_to_response(
            &ApiError::LimitExceeded {
                limit: decision.limit,
                reset_at: decision.reset_at,
                tier: decision.tier.clone(),
            },
            request_id,
        );
    }

    request.extensions_mut().insert(identity.clone());
    request.extensions_mut().insert(RequestId(request_id));

    let mut response = next.run(request).await;
    annotate_response(response.headers_mut(), request_id, &decision);

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        user_id = %identity.user_id,
        tier = %identity.tier.name,
        status = %response.status(),
        remaining = decision.remaining,
        degraded = decision.degraded,
        duration_ms = start.elapsed().as_millis(),
        "Request completed"
    );

    response
}

/// Attach the rate limit headers every admitted response carries.
fn annotate_response(headers: &mut HeaderMap, request_id: Uuid, decision: &RateLimitDecision) {
    put_request_id(headers, request_id);
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    put_numeric(headers, "x-ratelimit-reset", decision.reset_at);
    if decision.degraded {
        headers.insert("x-ratelimit-degraded", HeaderValue::from_static("true"));
    }
}

fn put_request_id(headers: &mut HeaderMap, request_id: Uuid) {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-request-id", value);
    }
}

fn put_numeric(headers: &mut HeaderMap, name: &'static str, value: u64) {
    match HeaderValue::from_str(&value.to_string()) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => {
            headers.insert(name, HeaderValue::from_static("0"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_exact_match() {
        let paths = vec!["/health".to_string()];
        assert!(should_exclude("/health", &paths));
        assert!(should_exclude("/health/", &paths));
        assert!(!should_exclude("/healthz", &paths));
        assert!(!should_exclude("/health/detail", &paths));
    }

    #[test]
    fn test_exclude_prefix_match() {
        let paths = vec!["/admin/*".to_string()];
        assert!(should_exclude("/admin", &paths));
        assert!(should_exclude("/admin/health", &paths));
        assert!(should_exclude("/admin/users/u1", &paths));
        assert!(!should_exclude("/administrator", &paths));
    }

    #[test]
    fn test_client_addr_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        headers.insert("x-real-ip", "192.168.0.9".parse().unwrap());
        assert_eq!(client_addr(&headers), "10.1.2.3");
    }

    #[test]
    fn test_client_addr_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.0.9".parse().unwrap());
        assert_eq!(client_addr(&headers), "192.168.0.9");
    }

    #[test]
    fn test_client_addr_unknown_without_headers() {
        assert_eq!(client_addr(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_limit_exceeded_response_carries_rate_headers() {
        let error = ApiError::LimitExceeded {
            limit: 20,
            reset_at: current_time_secs() + 30,
            tier: "free".to_string(),
        };
        let response = api_error_to_response(&error, Uuid::new_v4());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "20");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert!(headers.contains_key("x-ratelimit-reset"));
        assert!(headers.contains_key("retry-after"));
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn test_blocked_response_carries_retry_after() {
        let response =
            api_error_to_response(&ApiError::Blocked { retry_after: 900 }, Uuid::new_v4());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "900");
    }
}
