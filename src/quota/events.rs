/*!
 * Quota events and the fire-and-forget event bus
 */

use super::model::{QuotaType, UserQuota, WarningLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Published when a balance first drops to or below a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaWarningEvent {
    pub user_id: String,
    pub quota_type: QuotaType,
    pub total_quota: u64,
    pub remaining_quota: u64,
    pub used_quota: u64,
    /// Remaining balance as a percentage of the total
    pub remaining_percent: f64,
    pub level: WarningLevel,
    pub timestamp: DateTime<Utc>,
}

impl QuotaWarningEvent {
    pub fn from_quota(quota: &UserQuota, level: WarningLevel) -> Self {
        Self {
            user_id: quota.user_id.clone(),
            quota_type: quota.quota_type,
            total_quota: quota.total_quota,
            remaining_quota: quota.remaining_quota,
            used_quota: quota.used_quota,
            remaining_percent: quota.remaining_ratio() * 100.0,
            level,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QuotaEvent {
    #[serde(rename = "quota.warning")]
    Warning(QuotaWarningEvent),
}

impl QuotaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            QuotaEvent::Warning(_) => "quota.warning",
        }
    }

    pub fn source(&self) -> &'static str {
        "quota-service"
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            QuotaEvent::Warning(e) => e.timestamp,
        }
    }
}

/// Outbound event sink
///
/// `publish_async` must return without waiting on subscribers.
pub trait EventBus: Send + Sync {
    fn publish_async(&self, event: QuotaEvent);
}

/// Event bus over a tokio broadcast channel
///
/// Slow subscribers lose the oldest events instead of blocking publishers.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<QuotaEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish_async(&self, event: QuotaEvent) {
        let event_type = event.event_type();
        if self.sender.send(event).is_err() {
            debug!(event_type, "No subscribers for event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::model::UserRole;

    fn warning() -> QuotaEvent {
        let mut quota = UserQuota::new("u1", QuotaType::Daily, 100, UserRole::Reader);
        quota.consume(85).unwrap();
        QuotaEvent::Warning(QuotaWarningEvent::from_quota(&quota, WarningLevel::Warning))
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.subscribe();

        bus.publish_async(warning());

        let QuotaEvent::Warning(event) = rx.recv().await.unwrap();
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.remaining_quota, 15);
        assert_eq!(event.remaining_percent, 15.0);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let bus = BroadcastEventBus::new(1);
        bus.publish_async(warning());
        bus.publish_async(warning());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(warning()).unwrap();
        assert_eq!(json["type"], "quota.warning");
        assert_eq!(json["data"]["level"], "warning");
    }
}
