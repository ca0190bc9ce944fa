//! Aigate Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the gateway wraps around every call
//! to the remote AI service:
//!
//! - **Circuit Breaker**: Fails fast while the remote service is unhealthy and
//!   probes it again after a reset timeout
//! - **Retry Policy**: Bounded retries with linear or exponential backoff,
//!   per-attempt deadlines and prompt cancellation
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transport protocols (gRPC, HTTP)
//! - Quotas, users or billing
//! - Application-specific error types (they plug in through [`Retryable`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Gateway facade                  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Policy                      │  ← Transient-fault absorption
//! │  (Backoff, deadlines, cancellation)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Remote AI service
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use aigate_core_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, ResilienceError, RetryConfig, RetryPolicy,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new("ai-service", CircuitBreakerConfig::default());
//! let retry = RetryPolicy::new(RetryConfig::default());
//! let cancel = CancellationToken::new();
//!
//! if !breaker.allow_request().await {
//!     return Err(ResilienceError::CircuitOpen);
//! }
//!
//! match retry
//!     .execute(&cancel, None, |_attempt| async { Ok::<_, ResilienceError>(42) })
//!     .await
//! {
//!     Ok(_) => breaker.record_success().await,
//!     Err(failure) => {
//!         breaker.record_failure().await;
//!         return Err(failure.error);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod error;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use error::{ResilienceError, Retryable};
pub use retry::{BackoffStrategy, RetryConfig, RetryFailure, RetryPolicy};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use aigate_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::{ResilienceError, Retryable};
    pub use super::retry::{BackoffStrategy, RetryConfig, RetryFailure, RetryPolicy};
}
