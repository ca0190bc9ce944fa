/*!
 * Error types for the gateway
 */

use crate::quota::QuotaError;
use crate::registry::ProviderKind;
use crate::remote::RpcError;
use aigate_core_resilience::Retryable;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures surfaced by [`crate::gateway::Gateway::execute`]
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Request rejected before any admission check
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no executor registered for provider {0}")]
    NoExecutor(ProviderKind),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("service unavailable: circuit breaker is open")]
    CircuitOpen,

    #[error("remote call failed after {attempts} attempt(s): {source}")]
    Remote {
        attempts: u32,
        #[source]
        source: RpcError,
    },

    #[error("request cancelled")]
    Cancelled,

    /// The degraded path failed too; `reason` says why it was taken
    #[error("fallback failed after {reason}: {source}")]
    Fallback {
        reason: String,
        #[source]
        source: RpcError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Get error category for logging and caller-facing messages
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnknownModel(_) => {
                ErrorCategory::Caller
            }
            GatewayError::Quota(e) if e.is_admission_rejection() => ErrorCategory::Admission,
            GatewayError::Quota(QuotaError::InvalidAmount(_)) => ErrorCategory::Caller,
            GatewayError::Quota(_) => ErrorCategory::Internal,
            GatewayError::CircuitOpen => ErrorCategory::Admission,
            GatewayError::Remote { source, .. } => match source {
                RpcError::Cancelled => ErrorCategory::Cancelled,
                e if e.is_caller_error() => ErrorCategory::Caller,
                e if e.is_retryable() => ErrorCategory::Transient,
                _ => ErrorCategory::Remote,
            },
            GatewayError::Cancelled => ErrorCategory::Cancelled,
            GatewayError::Fallback { .. } => ErrorCategory::Remote,
            GatewayError::NoExecutor(_) | GatewayError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Refused by quota or the circuit breaker without reaching the service
    pub fn is_admission_rejection(&self) -> bool {
        self.category() == ErrorCategory::Admission
    }

    /// Worth retrying later; the gateway already retried within its budget
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request or unknown model
    Caller,
    /// Quota exhausted/suspended/insufficient or circuit open
    Admission,
    /// Transport failures that outlived the retry budget
    Transient,
    /// The remote service answered with a permanent failure
    Remote,
    /// The caller gave up
    Cancelled,
    /// Unexpected failures inside the gateway
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Caller => write!(f, "caller"),
            ErrorCategory::Admission => write!(f, "admission"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Remote => write!(f, "remote"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Configuration loading and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_categories() {
        assert_eq!(
            GatewayError::InvalidRequest("x".into()).category(),
            ErrorCategory::Caller
        );
        assert_eq!(GatewayError::CircuitOpen.category(), ErrorCategory::Admission);
        assert!(GatewayError::Quota(QuotaError::Suspended {
            user_id: "u".into()
        })
        .is_admission_rejection());
        assert_eq!(
            GatewayError::Quota(QuotaError::Store(crate::quota::StoreError::Backend(
                "down".into()
            )))
            .category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_remote_categories() {
        let remote = |source| GatewayError::Remote {
            attempts: 4,
            source,
        };
        assert!(remote(RpcError::status(Code::Unavailable, "down")).is_retryable());
        assert_eq!(
            remote(RpcError::status(Code::InvalidArgument, "bad")).category(),
            ErrorCategory::Caller
        );
        assert_eq!(
            remote(RpcError::ExecutionFailed {
                status: "failed".into(),
                errors: vec![]
            })
            .category(),
            ErrorCategory::Remote
        );
        assert_eq!(remote(RpcError::Cancelled).category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_remote_error_keeps_cause() {
        let err = GatewayError::Remote {
            attempts: 2,
            source: RpcError::status(Code::Unavailable, "connection refused"),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("connection refused"));
        assert!(err.to_string().contains("2 attempt(s)"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Admission.to_string(), "admission");
    }
}
