//! Resilience patterns for shared-store calls

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::infrastructure::store::StoreError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed through
    Closed,
    /// Circuit is open, requests are rejected immediately
    Open,
    /// Circuit is half-open, allowing a trial probe to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub recovery_timeout: Duration,
    /// Maximum number of probes allowed in HalfOpen state
    pub half_open_max_probes: u32,
    /// Per-call deadline applied to every guarded operation
    pub request_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
            request_timeout: Duration::from_millis(5),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    current_state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_probes: u32,
}

/// Circuit breaker guarding the shared store.
///
/// State machine: CLOSED counts consecutive failures and opens at the
/// threshold; OPEN fails fast until the recovery timeout elapses, then
/// admits a single HALF_OPEN probe; one probe success closes the circuit,
/// any probe failure re-opens it. Timeouts count as failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(CircuitBreakerState {
                current_state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                half_open_probes: 0,
            })),
        }
    }

    /// Execute an operation under the breaker with the per-call deadline.
    ///
    /// When the circuit is open the operation is not started at all and
    /// [`StoreError::Unavailable`] is returned immediately.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        if !self.can_execute().await {
            return Err(StoreError::Unavailable);
        }

        let result = tokio::time::timeout(self.config.request_timeout, operation()).await;

        match result {
            Ok(Ok(success)) => {
                self.on_success().await;
                Ok(success)
            }
            Ok(Err(error)) => {
                self.on_failure().await;
                Err(error)
            }
            Err(_) => {
                self.on_failure().await;
                Err(StoreError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Check whether a request may proceed, updating state as needed.
    async fn can_execute(&self) -> bool {
        let mut state = self.state.lock().await;

        match state.current_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = state.last_failure_time
                    && last_failure.elapsed() >= self.config.recovery_timeout
                {
                    state.current_state = CircuitState::HalfOpen;
                    state.half_open_probes = 1;
                    tracing::info!("Circuit breaker half-open, admitting trial probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_probes < self.config.half_open_max_probes {
                    state.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;

        if state.current_state != CircuitState::Closed {
            tracing::info!("Circuit breaker closed after successful probe");
        }
        state.current_state = CircuitState::Closed;
        state.failure_count = 0;
        state.half_open_probes = 0;
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;

        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.current_state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    state.current_state = CircuitState::Open;
                    tracing::warn!(
                        failures = state.failure_count,
                        "Circuit breaker opened after consecutive store failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.current_state = CircuitState::Open;
                state.half_open_probes = 0;
                tracing::warn!("Circuit breaker re-opened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Get current circuit breaker state
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.current_state
    }

    /// Get current consecutive failure count
    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.current_state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure_time = None;
        state.half_open_probes = 0;
    }
}
