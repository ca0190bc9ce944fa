//! Aigate Observability: call metrics, request tracing and quota usage
//!
//! This crate provides the observability layer the gateway records into on
//! every remote call:
//! - **Call metrics** per service with latency percentiles
//! - **Request traces** with a bounded completed history
//! - **Quota usage** totals per service and model
//! - **Prometheus metrics** for operational monitoring
//!
//! Nothing here is global. Every collector and tracer is an explicitly
//! constructed instance, so tests and multiple gateways in one process never
//! share state.
//!
//! ## Quick Start
//!
//! ```
//! use aigate_observability::{MetricsCollector, TraceStatus, Tracer};
//! use std::time::Duration;
//!
//! let metrics = MetricsCollector::new(1000);
//! let tracer = Tracer::new(1000);
//!
//! let guard = tracer.guard("ExecuteAgent", "req-1");
//! metrics.record_call("ExecuteAgent", true);
//! metrics.record_latency("ExecuteAgent", Duration::from_millis(85));
//! guard.finish(TraceStatus::Success, None);
//!
//! assert!(tracer.get_active_traces().is_empty());
//! println!("{}", metrics.format_report());
//! ```
//!
//! ## Trace Propagation
//!
//! [`TraceContext`] follows the W3C Trace Context format and is sent to the
//! remote service as a `traceparent` header:
//!
//! ```
//! use aigate_observability::TraceContext;
//!
//! let ctx = TraceContext::new_root();
//! println!("Traceparent: {}", ctx.to_traceparent());
//! // Output: 00-{trace_id}-{span_id}-01
//! ```
//!
//! ## Prometheus Metrics
//!
//! ```
//! use aigate_observability::{MetricsCollector, PrometheusExporter};
//!
//! let metrics = MetricsCollector::default().with_prometheus(PrometheusExporter::new()?);
//! metrics.record_retry("ExecuteAgent");
//!
//! let text = metrics.prometheus().map(|p| p.metrics_text()).transpose()?;
//! assert!(text.unwrap().contains("aigate_retries_total"));
//! # Ok::<(), aigate_observability::ObservabilityError>(())
//! ```

pub mod collector;
pub mod context;
pub mod error;
pub mod metrics;
pub mod quota_usage;
pub mod tracer;

pub use collector::{
    LatencyStats, MetricsCollector, PerformanceStats, ServiceStats, DEFAULT_MAX_LATENCY_SAMPLES,
};
pub use context::{generate_request_id, TraceContext};
pub use error::ObservabilityError;
pub use metrics::PrometheusExporter;
pub use quota_usage::{QuotaConsumption, QuotaUsageReport, QuotaUsageTracker};
pub use tracer::{
    RequestTrace, TraceGuard, TraceStats, TraceStatus, Tracer, DEFAULT_MAX_TRACE_HISTORY,
};

/// Prelude module for convenient imports
///
/// ```
/// use aigate_observability::prelude::*;
/// ```
pub mod prelude {
    pub use crate::collector::{LatencyStats, MetricsCollector, ServiceStats};
    pub use crate::context::TraceContext;
    pub use crate::tracer::{TraceGuard, TraceStatus, Tracer};
}
