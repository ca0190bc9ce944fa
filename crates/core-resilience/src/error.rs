//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// A single attempt ran past its deadline
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// The caller gave up while the operation was in flight or waiting to retry
    #[error("Operation cancelled")]
    Cancelled,
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::Timeout(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_) | ResilienceError::CircuitOpen | ResilienceError::Cancelled
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    ///
    /// Rejections by the breaker itself and caller cancellations never reached
    /// the protected service.
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen | ResilienceError::Cancelled
        )
    }
}

/// Classification hook used by [`crate::retry::RetryPolicy`].
///
/// Implementors decide which of their failures deserve another attempt and
/// provide the values the policy returns when an attempt times out or the
/// caller cancels.
pub trait Retryable: Sized {
    /// Whether another attempt may succeed
    fn is_retryable(&self) -> bool;

    /// Error produced when a single attempt exceeds its deadline
    fn deadline_exceeded(after: Duration) -> Self;

    /// Error produced when the caller cancels
    fn cancelled() -> Self;
}

impl Retryable for ResilienceError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn deadline_exceeded(after: Duration) -> Self {
        ResilienceError::Timeout(after)
    }

    fn cancelled() -> Self {
        ResilienceError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = ResilienceError::Transient("network error".to_string());
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());
        assert!(transient.should_trip_breaker());

        let permanent = ResilienceError::Permanent("auth failed".to_string());
        assert!(!permanent.is_transient());
        assert!(permanent.is_permanent());
        assert!(permanent.should_trip_breaker());

        let circuit_open = ResilienceError::CircuitOpen;
        assert!(!circuit_open.is_transient());
        assert!(circuit_open.is_permanent());
        assert!(!circuit_open.should_trip_breaker());

        assert!(!ResilienceError::Cancelled.should_trip_breaker());
        assert!(ResilienceError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
