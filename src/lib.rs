//! Quotagate - Distributed, tier-aware, load-adaptive API rate limiter
//!
//! For every inbound request the engine decides, within a few
//! milliseconds, whether to admit or reject based on the identity behind
//! the presented credential, the tier's quota and a global health signal
//! that modulates quotas in real time. Decisions are consistent across a
//! horizontally scaled fleet sharing one coordinating store.
//!
//! # Modules
//!
//! - [`config`] — layered configuration with validation, atomic snapshots
//!   and hot reload
//! - [`application`] — error taxonomy and credential resolution
//! - [`infrastructure`] — shared-store client, circuit breaker, sliding
//!   window counter, health and abuse services
//! - [`presentation`] — axum middleware, routes and admin handlers
//! - [`logging`] — structured logging with tracing
//!
//! # Architecture
//!
//! ```text
//! request
//!   └─ rate_limit_middleware
//!        ├─ allowlist short-circuit
//!        ├─ abuse block check          (shared store)
//!        ├─ credential -> user, tier   (config snapshot, no I/O)
//!        ├─ health state               (store, 2s in-process cache)
//!        ├─ effective limit            (pure, precomputed per tier)
//!        └─ sliding-window admission   (one atomic store script)
//! ```
//!
//! The shared store sits behind a circuit breaker with a per-call
//! deadline; when it is impaired the rate path fails open and the health
//! path assumes NORMAL, so requests keep completing.

pub mod application;
pub mod config;
pub mod infrastructure;
pub mod logging;
pub mod presentation;

pub use config::Config;
pub use logging::init_tracing;
pub use presentation::{AppContext, create_router};
