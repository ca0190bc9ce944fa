//! Per-request trace records
//!
//! A trace lives in the active set from [`Tracer::start_trace`] until
//! [`Tracer::end_trace`], then moves to a bounded completed set. Once the
//! completed set is full the oldest completed trace is evicted.
//!
//! Callers that may be cancelled should hold a [`TraceGuard`]: dropping it
//! without calling [`TraceGuard::finish`] ends the trace as
//! [`TraceStatus::Cancelled`], so abandoned futures never leak active traces.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of completed traces retained
pub const DEFAULT_MAX_TRACE_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Running => "running",
            TraceStatus::Success => "success",
            TraceStatus::Failed => "failed",
            TraceStatus::Timeout => "timeout",
            TraceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(TraceStatus::Running),
            "success" => Ok(TraceStatus::Success),
            "failed" => Ok(TraceStatus::Failed),
            "timeout" => Ok(TraceStatus::Timeout),
            "cancelled" => Ok(TraceStatus::Cancelled),
            other => Err(format!("unknown trace status: {other}")),
        }
    }
}

/// One request's trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTrace {
    pub request_id: String,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub status: TraceStatus,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl RequestTrace {
    fn start(service_name: &str, request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            service_name: service_name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            status: TraceStatus::Running,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    fn finish(&mut self, status: TraceStatus, error: Option<&dyn std::error::Error>) {
        let end = Utc::now();
        self.duration = Some((end - self.start_time).to_std().unwrap_or_default());
        self.end_time = Some(end);
        self.status = status;
        self.error = error.map(|e| e.to_string());
    }
}

/// Aggregate view over active and retained traces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceStats {
    /// Active traces plus every trace ended since creation or the last clear
    pub total_traces: usize,
    pub active_traces: usize,
    /// Completed traces still held in history
    pub retained_traces: usize,
    pub by_service: BTreeMap<String, usize>,
    pub by_status: BTreeMap<TraceStatus, usize>,
    /// Mean over completed traces only
    pub average_duration_ms: f64,
}

#[derive(Debug, Default)]
struct CompletedTraces {
    traces: HashMap<String, RequestTrace>,
    /// Request IDs, oldest first
    order: VecDeque<String>,
    /// Traces ended over the tracer's lifetime, including evicted ones
    ended: usize,
}

/// Bounded request tracer
#[derive(Debug)]
pub struct Tracer {
    active: DashMap<String, RequestTrace>,
    completed: Mutex<CompletedTraces>,
    max_history: usize,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACE_HISTORY)
    }
}

impl Tracer {
    pub fn new(max_history: usize) -> Self {
        Self {
            active: DashMap::new(),
            completed: Mutex::new(CompletedTraces::default()),
            max_history: max_history.max(1),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Register an active trace
    ///
    /// Starting a request ID that is already active replaces the earlier
    /// record.
    pub fn start_trace(&self, service_name: &str, request_id: &str) {
        let trace = RequestTrace::start(service_name, request_id);
        if self.active.insert(request_id.to_string(), trace).is_some() {
            warn!(request_id, "Trace restarted while still active");
        }
        debug!(request_id, service = service_name, "Trace started");
    }

    /// Attach a key/value pair to an active trace
    pub fn set_metadata(&self, request_id: &str, key: &str, value: impl Into<String>) -> bool {
        match self.active.get_mut(request_id) {
            Some(mut trace) => {
                trace.metadata.insert(key.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    /// Move an active trace to the completed set
    ///
    /// Returns the finished record, or `None` if no trace with this ID is
    /// active.
    pub fn end_trace(
        &self,
        request_id: &str,
        status: TraceStatus,
        error: Option<&dyn std::error::Error>,
    ) -> Option<RequestTrace> {
        let Some((_, mut trace)) = self.active.remove(request_id) else {
            debug!(request_id, "end_trace for unknown request");
            return None;
        };
        trace.finish(status, error);
        debug!(
            request_id,
            status = status.as_str(),
            duration_ms = trace.duration.map(|d| d.as_millis() as u64),
            "Trace ended"
        );

        let mut completed = self.completed.lock();
        if completed
            .traces
            .insert(request_id.to_string(), trace.clone())
            .is_some()
        {
            completed.order.retain(|id| id != request_id);
        }
        completed.order.push_back(request_id.to_string());
        completed.ended += 1;

        while completed.order.len() > self.max_history {
            if let Some(oldest) = completed.order.pop_front() {
                completed.traces.remove(&oldest);
            }
        }

        Some(trace)
    }

    /// Active or completed trace by request ID
    pub fn get_trace(&self, request_id: &str) -> Option<RequestTrace> {
        if let Some(trace) = self.active.get(request_id) {
            return Some(trace.clone());
        }
        self.completed.lock().traces.get(request_id).cloned()
    }

    /// Most recently completed traces, newest first
    pub fn get_recent_traces(&self, limit: usize) -> Vec<RequestTrace> {
        self.completed_where(limit, |_| true)
    }

    pub fn get_traces_by_service(&self, service_name: &str, limit: usize) -> Vec<RequestTrace> {
        self.completed_where(limit, |t| t.service_name == service_name)
    }

    pub fn get_traces_by_status(&self, status: TraceStatus, limit: usize) -> Vec<RequestTrace> {
        if status == TraceStatus::Running {
            let mut active = self.get_active_traces();
            active.truncate(limit);
            return active;
        }
        self.completed_where(limit, |t| t.status == status)
    }

    /// Active traces, oldest start first
    pub fn get_active_traces(&self) -> Vec<RequestTrace> {
        let mut traces: Vec<_> = self.active.iter().map(|t| t.value().clone()).collect();
        traces.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        traces
    }

    pub fn get_stats(&self) -> TraceStats {
        let mut stats = TraceStats::default();

        for trace in self.active.iter() {
            stats.active_traces += 1;
            *stats
                .by_service
                .entry(trace.service_name.clone())
                .or_default() += 1;
            *stats.by_status.entry(TraceStatus::Running).or_default() += 1;
        }

        let completed = self.completed.lock();
        let mut total_ms = 0.0;
        for trace in completed.traces.values() {
            *stats
                .by_service
                .entry(trace.service_name.clone())
                .or_default() += 1;
            *stats.by_status.entry(trace.status).or_default() += 1;
            total_ms += trace.duration.unwrap_or_default().as_secs_f64() * 1000.0;
        }

        stats.retained_traces = completed.traces.len();
        stats.total_traces = stats.active_traces + completed.ended;
        if !completed.traces.is_empty() {
            stats.average_duration_ms = total_ms / completed.traces.len() as f64;
        }
        stats
    }

    /// Drop every active and completed trace
    pub fn clear(&self) {
        self.active.clear();
        let mut completed = self.completed.lock();
        completed.traces.clear();
        completed.order.clear();
        completed.ended = 0;
    }

    /// Start a trace whose end is guaranteed on every exit path
    ///
    /// If `request_id` is already active the trace is keyed `<id>#<n>` with
    /// the lowest free `n`, so each guard only ever ends its own trace. The
    /// key in use is [`TraceGuard::request_id`].
    pub fn guard(&self, service_name: &str, request_id: &str) -> TraceGuard<'_> {
        let mut key = request_id.to_string();
        let mut n = 0;
        loop {
            match self.active.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(RequestTrace::start(service_name, &key));
                    break;
                }
                Entry::Occupied(_) => {
                    n += 1;
                    key = format!("{request_id}#{n}");
                }
            }
        }
        if n > 0 {
            warn!(request_id, trace_id = %key, "Request ID already active, trace renamed");
        }
        debug!(request_id = %key, service = service_name, "Trace started");
        TraceGuard {
            tracer: self,
            request_id: key,
            finished: false,
        }
    }

    fn completed_where<F>(&self, limit: usize, predicate: F) -> Vec<RequestTrace>
    where
        F: Fn(&RequestTrace) -> bool,
    {
        let completed = self.completed.lock();
        completed
            .order
            .iter()
            .rev()
            .filter_map(|id| completed.traces.get(id))
            .filter(|t| predicate(t))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Ends its trace as cancelled when dropped unfinished
#[must_use = "dropping a TraceGuard immediately ends the trace as cancelled"]
#[derive(Debug)]
pub struct TraceGuard<'a> {
    tracer: &'a Tracer,
    request_id: String,
    finished: bool,
}

impl TraceGuard<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn set_metadata(&self, key: &str, value: impl Into<String>) {
        self.tracer.set_metadata(&self.request_id, key, value);
    }

    pub fn finish(
        mut self,
        status: TraceStatus,
        error: Option<&dyn std::error::Error>,
    ) -> Option<RequestTrace> {
        self.finished = true;
        self.tracer.end_trace(&self.request_id, status, error)
    }
}

impl Drop for TraceGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracer
                .end_trace(&self.request_id, TraceStatus::Cancelled, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("deadline exceeded")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_pairs_leave_no_active_traces() {
        let tracer = Tracer::default();
        for i in 0..25 {
            let id = format!("req-{i}");
            tracer.start_trace("ExecuteAgent", &id);
            tracer.end_trace(&id, TraceStatus::Success, None);
        }

        assert!(tracer.get_active_traces().is_empty());
        let stats = tracer.get_stats();
        assert_eq!(stats.total_traces, 25);
        assert_eq!(stats.active_traces, 0);
        assert_eq!(stats.by_status[&TraceStatus::Success], 25);
        assert_eq!(stats.by_service["ExecuteAgent"], 25);
    }

    #[test]
    fn test_timeout_with_error_is_queryable() {
        let tracer = Tracer::default();
        tracer.start_trace("ExecuteAgent", "req-timeout");
        tracer.end_trace("req-timeout", TraceStatus::Timeout, Some(&Boom));

        let traces = tracer.get_traces_by_status(TraceStatus::Timeout, 10);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].request_id, "req-timeout");
        assert_eq!(traces[0].error.as_deref(), Some("deadline exceeded"));
        assert!(traces[0].end_time.is_some());
    }

    #[test]
    fn test_oldest_completed_is_evicted() {
        let tracer = Tracer::new(3);
        for i in 0..5 {
            let id = format!("req-{i}");
            tracer.start_trace("svc", &id);
            tracer.end_trace(&id, TraceStatus::Success, None);
        }

        assert!(tracer.get_trace("req-0").is_none());
        assert!(tracer.get_trace("req-1").is_none());
        let recent: Vec<_> = tracer
            .get_recent_traces(10)
            .into_iter()
            .map(|t| t.request_id)
            .collect();
        assert_eq!(recent, vec!["req-4", "req-3", "req-2"]);
    }

    #[test]
    fn test_total_counts_evicted_traces() {
        let tracer = Tracer::new(3);
        for i in 0..10 {
            let id = format!("req-{i}");
            tracer.start_trace("svc", &id);
            tracer.end_trace(&id, TraceStatus::Success, None);
        }
        tracer.start_trace("svc", "in-flight");

        let stats = tracer.get_stats();
        assert_eq!(stats.total_traces, 11);
        assert_eq!(stats.retained_traces, 3);
        assert_eq!(stats.active_traces, 1);

        tracer.clear();
        assert_eq!(tracer.get_stats().total_traces, 0);
    }

    #[test]
    fn test_guards_with_same_request_id_stay_separate() {
        let tracer = Tracer::default();
        let first = tracer.guard("svc", "dup");
        let second = tracer.guard("svc", "dup");
        assert_eq!(first.request_id(), "dup");
        assert_eq!(second.request_id(), "dup#1");
        assert_eq!(tracer.get_active_traces().len(), 2);

        let ended = first.finish(TraceStatus::Failed, Some(&Boom)).unwrap();
        assert_eq!(ended.request_id, "dup");
        assert_eq!(tracer.get_trace("dup#1").unwrap().status, TraceStatus::Running);

        let ended = second.finish(TraceStatus::Success, None).unwrap();
        assert_eq!(ended.request_id, "dup#1");
        assert_eq!(tracer.get_trace("dup").unwrap().status, TraceStatus::Failed);
        assert!(tracer.get_active_traces().is_empty());
    }

    #[test]
    fn test_end_unknown_trace() {
        let tracer = Tracer::default();
        assert!(tracer.end_trace("nope", TraceStatus::Failed, None).is_none());
        assert_eq!(tracer.get_stats().total_traces, 0);
    }

    #[test]
    fn test_active_trace_visible_as_running() {
        let tracer = Tracer::default();
        tracer.start_trace("svc", "req-1");
        assert!(tracer.set_metadata("req-1", "user_id", "u1"));

        let trace = tracer.get_trace("req-1").unwrap();
        assert_eq!(trace.status, TraceStatus::Running);
        assert_eq!(trace.metadata["user_id"], "u1");
        assert_eq!(tracer.get_traces_by_status(TraceStatus::Running, 10).len(), 1);
    }

    #[test]
    fn test_filter_by_service_respects_limit() {
        let tracer = Tracer::default();
        for i in 0..6 {
            let id = format!("req-{i}");
            let service = if i % 2 == 0 { "a" } else { "b" };
            tracer.start_trace(service, &id);
            tracer.end_trace(&id, TraceStatus::Failed, None);
        }

        let traces = tracer.get_traces_by_service("a", 2);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].request_id, "req-4");
    }

    #[test]
    fn test_guard_dropped_ends_as_cancelled() {
        let tracer = Tracer::default();
        {
            let _guard = tracer.guard("svc", "req-dropped");
            assert_eq!(tracer.get_active_traces().len(), 1);
        }

        assert!(tracer.get_active_traces().is_empty());
        let trace = tracer.get_trace("req-dropped").unwrap();
        assert_eq!(trace.status, TraceStatus::Cancelled);
    }

    #[test]
    fn test_guard_finish_is_not_overridden() {
        let tracer = Tracer::default();
        let guard = tracer.guard("svc", "req-ok");
        guard.finish(TraceStatus::Success, None);

        assert_eq!(
            tracer.get_trace("req-ok").unwrap().status,
            TraceStatus::Success
        );
    }

    #[tokio::test]
    async fn test_guard_in_cancelled_future() {
        let tracer = std::sync::Arc::new(Tracer::default());
        let t = std::sync::Arc::clone(&tracer);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let guard = t.guard("svc", "req-aborted");
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            guard.finish(TraceStatus::Success, None);
        });
        started_rx.await.unwrap();
        assert_eq!(tracer.get_active_traces().len(), 1);
        handle.abort();
        let _ = handle.await;

        assert!(tracer.get_active_traces().is_empty());
        assert_eq!(tracer.get_traces_by_status(TraceStatus::Cancelled, 10).len(), 1);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Timeout".parse::<TraceStatus>().unwrap(), TraceStatus::Timeout);
        assert!("bogus".parse::<TraceStatus>().is_err());
    }

    #[test]
    fn test_trace_serializes_lowercase_status() {
        let tracer = Tracer::default();
        tracer.start_trace("svc", "req-json");
        let trace = tracer.end_trace("req-json", TraceStatus::Timeout, None).unwrap();

        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["status"], "timeout");
        assert_eq!(json["service_name"], "svc");
    }
}
