//! Per-service call counters and latency percentiles
//!
//! Each service gets its own entry with its own locks. The outer map is a
//! [`DashMap`], so recording for one hot service never serializes updates to
//! unrelated services.
//!
//! Percentiles are computed at query time by sorting a bounded reservoir of
//! latency samples. Writes are O(1).

use crate::metrics::PrometheusExporter;
use crate::quota_usage::QuotaUsageTracker;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of latency samples retained per service
pub const DEFAULT_MAX_LATENCY_SAMPLES: usize = 1000;

/// Call counters for one service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

impl ServiceStats {
    /// Success percentage in [0, 100]; 0 when nothing was recorded
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64 * 100.0
    }
}

/// Latency summary for one service, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub count: u64,
}

/// Running latency aggregates plus a fixed-capacity sample reservoir
#[derive(Debug, Clone)]
pub struct PerformanceStats {
    pub total_latency_ms: u64,
    pub count: u64,
    pub min_ms: Option<u64>,
    pub max_ms: u64,
    pub timeouts: u64,
    pub retries: u64,
    samples: Vec<u64>,
    capacity: usize,
}

impl PerformanceStats {
    fn new(capacity: usize) -> Self {
        Self {
            total_latency_ms: 0,
            count: 0,
            min_ms: None,
            max_ms: 0,
            timeouts: 0,
            retries: 0,
            samples: Vec::with_capacity(capacity.min(DEFAULT_MAX_LATENCY_SAMPLES)),
            capacity,
        }
    }

    fn record(&mut self, latency_ms: u64) {
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency_ms);
        self.count += 1;
        self.min_ms = Some(self.min_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.max_ms = self.max_ms.max(latency_ms);

        // Reservoir sampling keeps every observation equally likely to be retained
        if self.samples.len() < self.capacity {
            self.samples.push(latency_ms);
        } else if self.capacity > 0 {
            let slot = rand::rng().random_range(0..self.count);
            if (slot as usize) < self.capacity {
                self.samples[slot as usize] = latency_ms;
            }
        }
    }

    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.count as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn summarize(&self) -> LatencyStats {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        LatencyStats {
            average_ms: self.average_ms(),
            min_ms: self.min_ms.unwrap_or(0),
            max_ms: self.max_ms,
            p50_ms: percentile(&sorted, 50),
            p95_ms: percentile(&sorted, 95),
            p99_ms: percentile(&sorted, 99),
            count: self.count,
        }
    }
}

/// Nearest-rank percentile over an already sorted slice
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[index]
}

#[derive(Debug)]
struct ServiceEntry {
    calls: Mutex<ServiceStats>,
    perf: Mutex<PerformanceStats>,
    rejections: AtomicU64,
}

impl ServiceEntry {
    fn new(capacity: usize) -> Self {
        Self {
            calls: Mutex::new(ServiceStats::default()),
            perf: Mutex::new(PerformanceStats::new(capacity)),
            rejections: AtomicU64::new(0),
        }
    }
}

/// Collector for call outcomes, latency, retries and timeouts
///
/// # Example
///
/// ```
/// use aigate_observability::MetricsCollector;
/// use std::time::Duration;
///
/// let metrics = MetricsCollector::new(1000);
/// metrics.record_call("ExecuteAgent", true);
/// metrics.record_latency("ExecuteAgent", Duration::from_millis(120));
///
/// let stats = metrics.get_stats_by_service("ExecuteAgent").unwrap();
/// assert_eq!(stats.success_rate(), 100.0);
/// ```
#[derive(Debug)]
pub struct MetricsCollector {
    services: DashMap<String, Arc<ServiceEntry>>,
    max_latency_samples: usize,
    quota: QuotaUsageTracker,
    exporter: Option<PrometheusExporter>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LATENCY_SAMPLES)
    }
}

impl MetricsCollector {
    pub fn new(max_latency_samples: usize) -> Self {
        Self {
            services: DashMap::new(),
            max_latency_samples,
            quota: QuotaUsageTracker::default(),
            exporter: None,
        }
    }

    /// Mirror every recorded value into a Prometheus registry
    pub fn with_prometheus(mut self, exporter: PrometheusExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn prometheus(&self) -> Option<&PrometheusExporter> {
        self.exporter.as_ref()
    }

    /// Quota consumption tracker
    pub fn quota(&self) -> &QuotaUsageTracker {
        &self.quota
    }

    fn entry(&self, service: &str) -> Arc<ServiceEntry> {
        if let Some(entry) = self.services.get(service) {
            return Arc::clone(entry.value());
        }
        let capacity = self.max_latency_samples;
        Arc::clone(
            self.services
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(ServiceEntry::new(capacity)))
                .value(),
        )
    }

    fn existing(&self, service: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(service).map(|e| Arc::clone(e.value()))
    }

    /// Record the outcome of one call
    pub fn record_call(&self, service: &str, success: bool) {
        let entry = self.entry(service);
        {
            let mut calls = entry.calls.lock();
            calls.total += 1;
            if success {
                calls.success += 1;
            } else {
                calls.failed += 1;
            }
        }
        if let Some(exporter) = &self.exporter {
            exporter.inc_call(service, if success { "success" } else { "failure" });
        }
    }

    /// Record a request refused before it reached the service
    pub fn record_rejection(&self, service: &str) {
        self.entry(service).rejections.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.inc_call(service, "rejected");
        }
    }

    pub fn record_latency(&self, service: &str, duration: Duration) {
        let latency_ms = duration.as_millis().min(u64::MAX as u128) as u64;
        self.entry(service).perf.lock().record(latency_ms);
        if let Some(exporter) = &self.exporter {
            exporter.observe_latency(service, duration.as_secs_f64());
        }
    }

    pub fn record_timeout(&self, service: &str) {
        self.entry(service).perf.lock().timeouts += 1;
        if let Some(exporter) = &self.exporter {
            exporter.inc_timeout(service);
        }
    }

    pub fn record_retry(&self, service: &str) {
        self.entry(service).perf.lock().retries += 1;
        if let Some(exporter) = &self.exporter {
            exporter.inc_retry(service);
        }
    }

    pub fn get_stats_by_service(&self, service: &str) -> Option<ServiceStats> {
        self.existing(service).map(|e| *e.calls.lock())
    }

    /// Snapshot of call counters for every known service
    pub fn get_all_stats(&self) -> BTreeMap<String, ServiceStats> {
        self.snapshot()
            .into_iter()
            .map(|(name, entry)| {
                let stats = *entry.calls.lock();
                (name, stats)
            })
            .collect()
    }

    pub fn get_latency_stats(&self, service: &str) -> Option<LatencyStats> {
        let entry = self.existing(service)?;
        let perf = entry.perf.lock();
        if perf.count == 0 {
            return None;
        }
        Some(perf.summarize())
    }

    pub fn get_all_latency_stats(&self) -> BTreeMap<String, LatencyStats> {
        self.snapshot()
            .into_iter()
            .filter_map(|(name, entry)| {
                let perf = entry.perf.lock();
                (perf.count > 0).then(|| (name, perf.summarize()))
            })
            .collect()
    }

    pub fn timeout_count(&self, service: &str) -> u64 {
        self.existing(service).map_or(0, |e| e.perf.lock().timeouts)
    }

    pub fn retry_count(&self, service: &str) -> u64 {
        self.existing(service).map_or(0, |e| e.perf.lock().retries)
    }

    pub fn rejection_count(&self, service: &str) -> u64 {
        self.existing(service)
            .map_or(0, |e| e.rejections.load(Ordering::Relaxed))
    }

    /// Drop all per-service statistics
    pub fn reset(&self) {
        self.services.clear();
    }

    pub fn reset_service(&self, service: &str) {
        self.services.remove(service);
    }

    // Copies the Arcs out so no DashMap shard lock is held while the
    // per-service mutexes are taken.
    fn snapshot(&self) -> Vec<(String, Arc<ServiceEntry>)> {
        let mut entries: Vec<_> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Human-readable report of call and latency statistics
    pub fn format_report(&self) -> String {
        let mut report = String::from("=== Remote call report ===\n\n## Calls\n");

        let entries = self.snapshot();
        for (name, entry) in &entries {
            let calls = *entry.calls.lock();
            let _ = writeln!(report, "{name}:");
            let _ = writeln!(report, "  total: {}", calls.total);
            let _ = writeln!(report, "  success: {}", calls.success);
            let _ = writeln!(report, "  failed: {}", calls.failed);
            let _ = writeln!(
                report,
                "  rejected: {}",
                entry.rejections.load(Ordering::Relaxed)
            );
            let _ = writeln!(report, "  success rate: {:.2}%\n", calls.success_rate());
        }

        report.push_str("## Performance\n");
        for (name, entry) in &entries {
            let perf = entry.perf.lock();
            let stats = perf.summarize();
            let _ = writeln!(report, "{name}:");
            let _ = writeln!(report, "  avg latency: {:.2}ms", stats.average_ms);
            let _ = writeln!(report, "  min latency: {}ms", stats.min_ms);
            let _ = writeln!(report, "  max latency: {}ms", stats.max_ms);
            let _ = writeln!(
                report,
                "  p50/p95/p99: {}/{}/{}ms",
                stats.p50_ms, stats.p95_ms, stats.p99_ms
            );
            let _ = writeln!(report, "  requests: {}", perf.count);
            let _ = writeln!(report, "  timeouts: {}", perf.timeouts);
            let _ = writeln!(report, "  retries: {}\n", perf.retries);
        }

        report
    }
}
