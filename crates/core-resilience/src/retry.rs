//! Retry policy with bounded backoff, per-attempt deadlines and cancellation
//!
//! The policy is generic over the error type: anything implementing
//! [`Retryable`] decides for itself which failures deserve another attempt.
//! Non-retryable failures are returned after the first attempt.
//!
//! Every suspension point (the attempt itself and the backoff sleep) races the
//! caller's [`CancellationToken`] and the caller's absolute deadline, so a
//! caller that gives up gets control back promptly.

use crate::error::Retryable;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shape of the delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base_delay * retry_number`
    Linear,
    /// `base_delay * multiplier^(retry_number - 1)`
    Exponential,
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Deadline applied to each individual attempt
    pub attempt_timeout: Duration,
    pub backoff: BackoffStrategy,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Final error after the policy gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    /// Attempts actually started
    pub attempts: u32,
    /// Error from the last attempt (or the cancellation/deadline marker)
    pub error: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.error)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Retry executor
///
/// # Example
/// ```no_run
/// use aigate_core_resilience::{RetryConfig, RetryPolicy, ResilienceError};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let policy = RetryPolicy::new(RetryConfig::default());
/// let cancel = CancellationToken::new();
///
/// let result = policy
///     .execute(&cancel, None, |_attempt| async {
///         Ok::<_, ResilienceError>("done")
///     })
///     .await;
/// assert!(result.is_ok());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Maximum number of attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.config.base_delay.as_secs_f64();
        let secs = match self.config.backoff {
            BackoffStrategy::Linear => base * retry as f64,
            BackoffStrategy::Exponential => {
                let exp = (retry - 1).min(i32::MAX as u32) as i32;
                base * self.config.multiplier.powi(exp)
            }
        };
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let extra = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `op` receives the zero-based attempt number. `deadline` is the caller's
    /// own absolute deadline; when it is earlier than the per-attempt timeout
    /// it wins.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_observed(cancel, deadline, op, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_error` with the
    /// zero-based attempt number after every failed attempt, including
    /// attempts cut short by the per-attempt timeout.
    pub async fn execute_observed<T, E, F, Fut, O>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        mut op: F,
        mut on_error: O,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(u32, &E),
    {
        let max_attempts = self.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    attempts: attempt,
                    error: E::cancelled(),
                });
            }

            let budget = match remaining(deadline) {
                Some(left) if left.is_zero() => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error: E::deadline_exceeded(Duration::ZERO),
                    });
                }
                Some(left) => left.min(self.config.attempt_timeout),
                None => self.config.attempt_timeout,
            };

            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(E::cancelled()),
                res = tokio::time::timeout(budget, op(attempt - 1)) => match res {
                    Ok(res) => res,
                    Err(_) => Err(E::deadline_exceeded(budget)),
                },
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            on_error(attempt - 1, &error);

            if !error.is_retryable() || cancel.is_cancelled() {
                debug!(attempt, error = %error, "Not retrying");
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.jittered(self.backoff(attempt));
            if let Some(left) = remaining(deadline) {
                if left <= delay {
                    debug!(attempt, ?delay, "Caller deadline expires before next retry");
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
            }

            debug!(attempt, ?delay, error = %error, "Retrying after backoff");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error: E::cancelled(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            attempt_timeout: Duration::from_secs(5),
            backoff: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        })
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(3);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = RetryPolicy::new(RetryConfig {
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..Default::default()
        });
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(60), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_use_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = policy(3)
            .execute(&cancel, None, move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ResilienceError::Transient("unavailable".into()))
                }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(failure.error, ResilienceError::Transient(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = policy(3)
            .execute(&cancel, None, move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ResilienceError::Permanent("invalid argument".into()))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failure() {
        let cancel = CancellationToken::new();

        let result = policy(3)
            .execute(&cancel, None, |attempt| async move {
                if attempt < 2 {
                    Err(ResilienceError::Transient("busy".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 1,
            attempt_timeout: Duration::from_millis(50),
            base_delay: Duration::from_millis(10),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let result: Result<(), RetryFailure<ResilienceError>> = p
            .execute(&cancel, None, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.error, ResilienceError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_wins_over_attempt_timeout() {
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(20);

        let result: Result<(), _> = policy(3)
            .execute(&cancel, Some(deadline), |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.error, ResilienceError::Timeout(d) if d <= Duration::from_millis(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_promptly() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = p
            .execute(&cancel, None, |_| async {
                Err(ResilienceError::Transient("unavailable".into()))
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.error, ResilienceError::Cancelled);
        assert_eq!(failure.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryFailure<ResilienceError>> = policy(3)
            .execute(&cancel, None, |_| async { Ok(()) })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 0);
        assert_eq!(failure.error, ResilienceError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_failed_attempt() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 2,
            attempt_timeout: Duration::from_millis(50),
            base_delay: Duration::from_millis(10),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();

        let result: Result<(), _> = p
            .execute_observed(
                &cancel,
                None,
                |attempt| async move {
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(ResilienceError::Transient("unavailable".into()))
                },
                |attempt, err: &ResilienceError| seen.push((attempt, err.clone())),
            )
            .await;

        assert_eq!(result.unwrap_err().attempts, 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (0, ResilienceError::Timeout(Duration::from_millis(50))));
        assert!(matches!(seen[2].1, ResilienceError::Transient(_)));
    }
}
