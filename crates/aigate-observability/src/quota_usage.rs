//! Quota consumption statistics
//!
//! Tracks how many tokens each service and model burned through, plus how
//! often a consumption failed after the remote call had already succeeded.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

/// Number of consumption records retained for reporting
pub const QUOTA_HISTORY_LIMIT: usize = 1000;

/// Number of records shown in the report's recent list
pub const RECENT_CONSUMPTION_LIMIT: usize = 20;

/// One successful quota consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConsumption {
    pub user_id: String,
    pub service: String,
    pub model: String,
    pub tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated quota usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsageReport {
    pub total_consumed: u64,
    pub consumption_count: u64,
    pub shortage_count: u64,
    pub by_service: BTreeMap<String, u64>,
    pub by_model: BTreeMap<String, u64>,
    /// Newest first
    pub recent: Vec<QuotaConsumption>,
    pub average_per_request: f64,
    pub top_service: Option<String>,
    pub top_model: Option<String>,
}

impl QuotaUsageReport {
    pub fn format(&self) -> String {
        let mut out = String::from("=== Quota usage report ===\n\n");
        let _ = writeln!(out, "total consumed: {}", self.total_consumed);
        let _ = writeln!(out, "consumptions: {}", self.consumption_count);
        let _ = writeln!(out, "shortages: {}", self.shortage_count);
        let _ = writeln!(out, "average per request: {:.2}", self.average_per_request);
        if let Some(service) = &self.top_service {
            let _ = writeln!(out, "top service: {service}");
        }
        if let Some(model) = &self.top_model {
            let _ = writeln!(out, "top model: {model}");
        }

        out.push_str("\n## By service\n");
        for (service, tokens) in &self.by_service {
            let _ = writeln!(out, "  {service}: {tokens}");
        }
        out.push_str("\n## By model\n");
        for (model, tokens) in &self.by_model {
            let _ = writeln!(out, "  {model}: {tokens}");
        }
        out
    }
}

#[derive(Debug, Default)]
struct QuotaUsageState {
    total_consumed: u64,
    consumption_count: u64,
    shortage_count: u64,
    shortages_by_user: BTreeMap<String, u64>,
    by_service: BTreeMap<String, u64>,
    by_model: BTreeMap<String, u64>,
    history: VecDeque<QuotaConsumption>,
}

/// Thread-safe quota usage tracker
#[derive(Debug, Default)]
pub struct QuotaUsageTracker {
    state: Mutex<QuotaUsageState>,
}

impl QuotaUsageTracker {
    pub fn record_quota_consumed(&self, user_id: &str, service: &str, model: &str, tokens: u64) {
        let mut state = self.state.lock();
        state.total_consumed = state.total_consumed.saturating_add(tokens);
        state.consumption_count += 1;
        *state.by_service.entry(service.to_string()).or_default() += tokens;
        *state.by_model.entry(model.to_string()).or_default() += tokens;

        if state.history.len() == QUOTA_HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(QuotaConsumption {
            user_id: user_id.to_string(),
            service: service.to_string(),
            model: model.to_string(),
            tokens,
            timestamp: Utc::now(),
        });
    }

    /// Record a consumption that could not be debited
    pub fn record_quota_shortage(&self, user_id: &str) {
        let mut state = self.state.lock();
        state.shortage_count += 1;
        *state.shortages_by_user.entry(user_id.to_string()).or_default() += 1;
    }

    pub fn shortages_for_user(&self, user_id: &str) -> u64 {
        self.state
            .lock()
            .shortages_by_user
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn quota_report(&self) -> QuotaUsageReport {
        let state = self.state.lock();

        let average_per_request = if state.consumption_count == 0 {
            0.0
        } else {
            state.total_consumed as f64 / state.consumption_count as f64
        };

        QuotaUsageReport {
            total_consumed: state.total_consumed,
            consumption_count: state.consumption_count,
            shortage_count: state.shortage_count,
            by_service: state.by_service.clone(),
            by_model: state.by_model.clone(),
            recent: state
                .history
                .iter()
                .rev()
                .take(RECENT_CONSUMPTION_LIMIT)
                .cloned()
                .collect(),
            average_per_request,
            top_service: top_key(&state.by_service),
            top_model: top_key(&state.by_model),
        }
    }

    pub fn reset_quota_metrics(&self) {
        *self.state.lock() = QuotaUsageState::default();
    }
}

// Ties resolve to the lexicographically smallest key.
fn top_key(map: &BTreeMap<String, u64>) -> Option<String> {
    map.iter()
        .fold(None, |best: Option<(&String, u64)>, (key, &value)| match best {
            Some((_, best_value)) if best_value >= value => best,
            _ => Some((key, value)),
        })
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_by_service_and_model() {
        let tracker = QuotaUsageTracker::default();
        tracker.record_quota_consumed("u1", "ExecuteAgent", "gpt-4", 30);
        tracker.record_quota_consumed("u2", "ExecuteAgent", "claude", 10);
        tracker.record_quota_consumed("u1", "GenerateOutline", "gpt-4", 20);

        let report = tracker.quota_report();
        assert_eq!(report.total_consumed, 60);
        assert_eq!(report.consumption_count, 3);
        assert_eq!(report.by_service["ExecuteAgent"], 40);
        assert_eq!(report.by_model["gpt-4"], 50);
        assert_eq!(report.average_per_request, 20.0);
        assert_eq!(report.top_service.as_deref(), Some("ExecuteAgent"));
        assert_eq!(report.top_model.as_deref(), Some("gpt-4"));
    }

    #[test]
    fn test_recent_is_newest_first_and_bounded() {
        let tracker = QuotaUsageTracker::default();
        for i in 0..50 {
            tracker.record_quota_consumed("u", "svc", "m", i);
        }

        let report = tracker.quota_report();
        assert_eq!(report.recent.len(), RECENT_CONSUMPTION_LIMIT);
        assert_eq!(report.recent[0].tokens, 49);
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = QuotaUsageTracker::default();
        for _ in 0..QUOTA_HISTORY_LIMIT + 10 {
            tracker.record_quota_consumed("u", "svc", "m", 1);
        }
        assert_eq!(tracker.state.lock().history.len(), QUOTA_HISTORY_LIMIT);
        assert_eq!(
            tracker.quota_report().total_consumed,
            (QUOTA_HISTORY_LIMIT + 10) as u64
        );
    }

    #[test]
    fn test_shortages_and_reset() {
        let tracker = QuotaUsageTracker::default();
        tracker.record_quota_shortage("u1");
        tracker.record_quota_shortage("u1");
        tracker.record_quota_shortage("u2");

        assert_eq!(tracker.quota_report().shortage_count, 3);
        assert_eq!(tracker.shortages_for_user("u1"), 2);

        tracker.reset_quota_metrics();
        let report = tracker.quota_report();
        assert_eq!(report.shortage_count, 0);
        assert!(report.top_service.is_none());
        assert_eq!(report.average_per_request, 0.0);
    }

    #[test]
    fn test_format_mentions_top_service() {
        let tracker = QuotaUsageTracker::default();
        tracker.record_quota_consumed("u", "ExecuteAgent", "gpt-4", 5);
        assert!(tracker.quota_report().format().contains("top service: ExecuteAgent"));
    }
}
