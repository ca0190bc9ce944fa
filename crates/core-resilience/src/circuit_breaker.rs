//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when the
//! remote service is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered
//!
//! Every transition happens under a single mutex. `allow_request` takes the
//! same lock as `record_failure`, so the reset-timeout check can never race a
//! concurrent failure that reopens the circuit.

use super::error::ResilienceError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    /// `opened_at` marks the start of the reset timeout
    Open { opened_at: Instant },
    /// Circuit is half-open, probing whether the service recovered
    HalfOpen,
}

impl CircuitState {
    /// Short lowercase name used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Whether the circuit is currently open
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: usize,
    /// Duration to wait before transitioning from open to half-open
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    /// Time spent in the open state so far, if open
    pub open_for: Option<Duration>,
    /// Requests denied by `allow_request`
    pub total_rejections: u64,
    /// Number of state changes since creation (or last reset)
    pub total_transitions: u64,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    total_rejections: u64,
    total_transitions: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_rejections: 0,
            total_transitions: 0,
        }
    }

    fn transition(&mut self, name: &str, next: CircuitState) {
        let previous = self.state;
        self.state = next;
        self.total_transitions += 1;
        match next {
            CircuitState::Open { .. } => warn!(
                breaker = name,
                from = previous.as_str(),
                failures = self.consecutive_failures,
                "Circuit opened"
            ),
            _ => info!(
                breaker = name,
                from = previous.as_str(),
                to = next.as_str(),
                "Circuit state changed"
            ),
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use aigate_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("ai-service", CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        let state = self.state.lock().await;
        state.state
    }

    /// Get a snapshot of counters and state
    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        CircuitBreakerStats {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            open_for: match state.state {
                CircuitState::Open { opened_at } => Some(opened_at.elapsed()),
                _ => None,
            },
            total_rejections: state.total_rejections,
            total_transitions: state.total_transitions,
        }
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Closed {
            state.transition(&self.name, CircuitState::Closed);
        }
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
    }

    /// Decide whether a request may reach the protected service
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open and
    /// admits the caller as a probe.
    pub async fn allow_request(&self) -> bool {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    state.consecutive_successes = 0;
                    state.transition(&self.name, CircuitState::HalfOpen);
                    true
                } else {
                    state.total_rejections += 1;
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful call to the protected service
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;

                if state.consecutive_successes >= self.config.success_threshold {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.transition(&self.name, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened finished late; the
            // reset timeout still decides when probing starts.
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call to the protected service
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;

                if state.consecutive_failures >= self.config.failure_threshold {
                    state.consecutive_successes = 0;
                    state.transition(
                        &self.name,
                        CircuitState::Open {
                            opened_at: Instant::now(),
                        },
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens with a fresh timeout
                state.consecutive_successes = 0;
                state.transition(
                    &self.name,
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Errors for which [`ResilienceError::should_trip_breaker`] is false are
    /// returned without touching the failure count.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        if !self.allow_request().await {
            return Err(ResilienceError::CircuitOpen);
        }

        match op().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    self.record_failure().await;
                }
                Err(e)
            }
        }
    }
}
