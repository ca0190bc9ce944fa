/*!
 * Configuration types for the gateway
 */

use crate::error::ConfigError;
use crate::quota::{QuotaSettings, QuotaType, UserRole};
use crate::registry::ProviderKind;
use aigate_core_resilience::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration; every section may be omitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub breaker: BreakerConfig,
    pub retry: RetrySettings,
    pub quota: QuotaConfig,
    pub observability: ObservabilityConfig,
    pub logging: LoggingConfig,
    pub remote: RemoteConfig,
    pub fallback: FallbackConfig,
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Consecutive half-open successes that close it again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

/// Backoff shape as written in config files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    #[serde(default)]
    pub backoff: BackoffKind,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Growth factor for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            attempt_timeout_secs: default_attempt_timeout(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Disable to admit every request without quota checks
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Debit the estimate before the call and reconcile afterwards
    #[serde(default)]
    pub pre_debit: bool,

    /// Estimate used when a request carries none
    #[serde(default = "default_estimate")]
    pub default_estimate: u64,

    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub quota_type: QuotaType,

    /// Role assumed for users seen for the first time
    #[serde(default)]
    pub default_role: UserRole,

    #[serde(default = "default_reader_quota")]
    pub reader_quota: u64,

    #[serde(default = "default_author_quota")]
    pub author_quota: u64,

    #[serde(default = "default_admin_quota")]
    pub admin_quota: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_debit: false,
            default_estimate: default_estimate(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            cache_ttl_secs: default_cache_ttl(),
            quota_type: QuotaType::default(),
            default_role: UserRole::default(),
            reader_quota: default_reader_quota(),
            author_quota: default_author_quota(),
            admin_quota: default_admin_quota(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Completed traces kept for queries
    #[serde(default = "default_capacity")]
    pub max_trace_history: usize,

    /// Latency samples kept per service for percentiles
    #[serde(default = "default_capacity")]
    pub max_latency_samples: usize,

    /// Mirror metrics into a Prometheus registry
    #[serde(default)]
    pub prometheus: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            max_trace_history: default_capacity(),
            max_latency_samples: default_capacity(),
            prometheus: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Serve a degraded response while the circuit is open
    #[serde(default)]
    pub enabled: bool,

    /// Also serve it after a failed primary call
    #[serde(default)]
    pub on_error: bool,

    #[serde(default = "default_fallback_message")]
    pub message: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_error: false,
            message: default_fallback_message(),
        }
    }
}

/// One `[[models]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,

    #[serde(default)]
    pub provider: ProviderKind,

    /// Model used when a request names none
    #[serde(default)]
    pub default: bool,

    /// Largest estimate a single request may carry
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> usize {
    5
}

fn default_success_threshold() -> usize {
    2
}

fn default_reset_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_estimate() -> u64 {
    1
}

fn default_warning_threshold() -> f64 {
    0.20
}

fn default_critical_threshold() -> f64 {
    0.10
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_reader_quota() -> u64 {
    100
}

fn default_author_quota() -> u64 {
    1000
}

fn default_admin_quota() -> u64 {
    10000
}

fn default_capacity() -> usize {
    1000
}

fn default_endpoint() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_fallback_message() -> String {
    "The AI service is temporarily unavailable. Please try again later.".to_string()
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be > 0");
        }
        if self.breaker.success_threshold == 0 {
            return invalid("breaker.success_threshold must be > 0");
        }
        if self.retry.attempt_timeout_secs == 0 {
            return invalid("retry.attempt_timeout_secs must be > 0");
        }
        if self.retry.backoff == BackoffKind::Exponential && self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0 for exponential backoff");
        }

        let q = &self.quota;
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(q.warning_threshold) || !in_unit(q.critical_threshold) {
            return invalid("quota thresholds must be in (0, 1]");
        }
        if q.critical_threshold >= q.warning_threshold {
            return invalid("quota.critical_threshold must be below quota.warning_threshold");
        }

        if self.observability.max_trace_history == 0 || self.observability.max_latency_samples == 0
        {
            return invalid("observability capacities must be > 0");
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                return invalid("model id must not be empty");
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate model id: {}", model.id)));
            }
        }
        if self.models.iter().filter(|m| m.default).count() > 1 {
            return invalid("at most one model may be marked default");
        }

        Ok(())
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            success_threshold: self.breaker.success_threshold,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let r = &self.retry;
        RetryConfig {
            max_retries: r.max_retries,
            attempt_timeout: Duration::from_secs(r.attempt_timeout_secs),
            backoff: match r.backoff {
                BackoffKind::Linear => BackoffStrategy::Linear,
                BackoffKind::Exponential => BackoffStrategy::Exponential,
            },
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_secs(r.max_delay_secs),
            multiplier: r.multiplier,
            jitter: r.jitter,
        }
    }

    pub fn quota_settings(&self) -> QuotaSettings {
        let q = &self.quota;
        QuotaSettings {
            warning_threshold: q.warning_threshold,
            critical_threshold: q.critical_threshold,
            cache_ttl: Duration::from_secs(q.cache_ttl_secs),
            quota_type: q.quota_type,
            default_role: q.default_role,
            reader_quota: q.reader_quota,
            author_quota: q.author_quota,
            admin_quota: q.admin_quota,
        }
    }
}
