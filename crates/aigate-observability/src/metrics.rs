//! Prometheus export of gateway call metrics
//!
//! Each [`PrometheusExporter`] owns its own [`Registry`], so tests and
//! multiple gateways in one process never share counters.

use crate::error::ObservabilityError;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Per-instance Prometheus registry for gateway metrics
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Registry,
    /// Labels: service, outcome (success, failure, rejected)
    calls_total: CounterVec,
    /// Labels: service
    retries_total: CounterVec,
    /// Labels: service
    timeouts_total: CounterVec,
    /// Labels: service
    /// Buckets: 10ms, 50ms, 100ms, 500ms, 1s, 5s, 10s, 30s
    call_latency_seconds: HistogramVec,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    /// Create an exporter with a fresh registry and all metrics registered
    pub fn new() -> Result<Self, ObservabilityError> {
        let registry = Registry::new();

        let calls_total = CounterVec::new(
            Opts::new(
                "aigate_calls_total",
                "Total number of calls to the remote AI service",
            ),
            &["service", "outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let retries_total = CounterVec::new(
            Opts::new("aigate_retries_total", "Total number of retry attempts"),
            &["service"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let timeouts_total = CounterVec::new(
            Opts::new(
                "aigate_timeouts_total",
                "Total number of calls that hit their deadline",
            ),
            &["service"],
        )?;
        registry.register(Box::new(timeouts_total.clone()))?;

        let call_latency_seconds = HistogramVec::new(
            HistogramOpts::new("aigate_call_latency_seconds", "Remote call latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["service"],
        )?;
        registry.register(Box::new(call_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            calls_total,
            retries_total,
            timeouts_total,
            call_latency_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc_call(&self, service: &str, outcome: &str) {
        self.calls_total.with_label_values(&[service, outcome]).inc();
    }

    pub fn inc_retry(&self, service: &str) {
        self.retries_total.with_label_values(&[service]).inc();
    }

    pub fn inc_timeout(&self, service: &str) {
        self.timeouts_total.with_label_values(&[service]).inc();
    }

    pub fn observe_latency(&self, service: &str, duration_secs: f64) {
        self.call_latency_seconds
            .with_label_values(&[service])
            .observe(duration_secs);
    }

    /// Get metrics in Prometheus text format
    pub fn metrics_text(&self) -> Result<String, ObservabilityError> {
        use prometheus::{Encoder, TextEncoder};

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ObservabilityError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_isolated() {
        let a = PrometheusExporter::new().unwrap();
        let b = PrometheusExporter::new().unwrap();

        a.inc_call("ExecuteAgent", "success");

        assert!(a.metrics_text().unwrap().contains("aigate_calls_total"));
        assert!(!b.metrics_text().unwrap().contains("ExecuteAgent"));
    }

    #[test]
    fn test_metrics_text_contains_all_families() {
        let exporter = PrometheusExporter::new().unwrap();
        exporter.inc_call("ExecuteAgent", "failure");
        exporter.inc_retry("ExecuteAgent");
        exporter.inc_timeout("ExecuteAgent");
        exporter.observe_latency("ExecuteAgent", 0.15);

        let output = exporter.metrics_text().unwrap();
        assert!(output.contains("aigate_calls_total"));
        assert!(output.contains("aigate_retries_total"));
        assert!(output.contains("aigate_timeouts_total"));
        assert!(output.contains("aigate_call_latency_seconds"));
    }
}
