//! HTTP surface: middleware, routes and admin handlers

pub mod admin;
pub mod middleware;
pub mod models;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use crate::config::SnapshotHandle;
use crate::infrastructure::abuse::AbuseGuard;
use crate::infrastructure::health::HealthService;
use crate::infrastructure::rate_limiter::RateLimitService;
use crate::infrastructure::resilience::CircuitBreaker;
use crate::infrastructure::store::RateStore;

pub use routes::create_router;

/// Context bundle threaded through the middleware and handlers.
///
/// All services are shared behind `Arc`; cloning the context clones
/// pointers only.
#[derive(Clone)]
pub struct AppContext {
    pub snapshots: Arc<SnapshotHandle>,
    pub rate_limiter: Arc<RateLimitService>,
    pub abuse: Arc<AbuseGuard>,
    pub health: Arc<HealthService>,
    pub store: Arc<dyn RateStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub started_at: Instant,
}
