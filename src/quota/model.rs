/*!
 * Quota records and ledger entries
 */

use super::error::QuotaError;
use chrono::{DateTime, Days, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reset period of a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    #[default]
    Daily,
    Monthly,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Daily => "daily",
            QuotaType::Monthly => "monthly",
        }
    }

    /// Next reset instant after `now`
    pub fn next_reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            QuotaType::Daily => now.checked_add_days(Days::new(1)),
            QuotaType::Monthly => now.checked_add_months(Months::new(1)),
        };
        next.unwrap_or(now)
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    #[default]
    Active,
    Exhausted,
    Suspended,
}

/// Role tier that decides a new user's default quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Reader,
    Author,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Reader => "reader",
            UserRole::Author => "author",
            UserRole::Admin => "admin",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reader" => Ok(UserRole::Reader),
            "author" => Ok(UserRole::Author),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown user role: {other}")),
        }
    }
}

/// Severity of a low-balance alert; `Critical` outranks `Warning`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Warning,
    Critical,
}

impl WarningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::Warning => "warning",
            WarningLevel::Critical => "critical",
        }
    }

    /// Level for a remaining fraction, or `None` above both thresholds
    pub fn for_ratio(ratio: f64, warning: f64, critical: f64) -> Option<Self> {
        if ratio <= critical {
            Some(WarningLevel::Critical)
        } else if ratio <= warning {
            Some(WarningLevel::Warning)
        } else {
            None
        }
    }
}

/// One user's balance for one quota period
///
/// `remaining_quota == total_quota - used_quota` and
/// `used_quota <= total_quota` hold after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: String,
    pub quota_type: QuotaType,
    pub total_quota: u64,
    pub used_quota: u64,
    pub remaining_quota: u64,
    pub status: QuotaStatus,
    pub reset_at: DateTime<Utc>,
    pub role: UserRole,
    /// Incremented by the store on every successful update
    pub version: u64,
    /// Most severe alert already published since the balance last recovered
    #[serde(default)]
    pub warning_level: Option<WarningLevel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserQuota {
    pub fn new(
        user_id: impl Into<String>,
        quota_type: QuotaType,
        total_quota: u64,
        role: UserRole,
    ) -> Self {
        let now = Utc::now();
        let mut quota = Self {
            user_id: user_id.into(),
            quota_type,
            total_quota,
            used_quota: 0,
            remaining_quota: total_quota,
            status: QuotaStatus::Active,
            reset_at: quota_type.next_reset_at(now),
            role,
            version: 0,
            warning_level: None,
            created_at: now,
            updated_at: now,
        };
        quota.refresh_status();
        quota
    }

    pub fn can_consume(&self, amount: u64) -> bool {
        self.check(amount).is_ok()
    }

    /// Admission check without mutating the balance
    pub fn check(&self, amount: u64) -> Result<(), QuotaError> {
        match self.status {
            QuotaStatus::Suspended => Err(QuotaError::Suspended {
                user_id: self.user_id.clone(),
            }),
            QuotaStatus::Exhausted => Err(QuotaError::Exhausted {
                user_id: self.user_id.clone(),
            }),
            QuotaStatus::Active if self.remaining_quota < amount => {
                Err(QuotaError::Insufficient {
                    user_id: self.user_id.clone(),
                    requested: amount,
                    remaining: self.remaining_quota,
                })
            }
            QuotaStatus::Active => Ok(()),
        }
    }

    /// Debit `amount`; fails closed without touching the balance
    pub fn consume(&mut self, amount: u64) -> Result<(), QuotaError> {
        self.check(amount)?;
        self.used_quota += amount;
        self.remaining_quota = self.total_quota - self.used_quota;
        self.touch();
        Ok(())
    }

    /// Credit back up to `amount` of previous consumption
    ///
    /// Returns the amount actually restored, which is capped by what was used.
    pub fn restore(&mut self, amount: u64) -> u64 {
        let restored = amount.min(self.used_quota);
        self.used_quota -= restored;
        self.remaining_quota = self.total_quota - self.used_quota;
        self.touch();
        restored
    }

    /// Grow the total and the remaining balance by `amount`
    pub fn recharge(&mut self, amount: u64) {
        self.total_quota = self.total_quota.saturating_add(amount);
        self.remaining_quota = self.total_quota - self.used_quota;
        self.touch();
    }

    /// Replace the total, keeping usage up to the new total
    pub fn set_total(&mut self, total_quota: u64) {
        self.total_quota = total_quota;
        self.used_quota = self.used_quota.min(total_quota);
        self.remaining_quota = total_quota - self.used_quota;
        self.touch();
    }

    /// Start a new period: usage back to zero, alerts cleared
    pub fn reset(&mut self) {
        let now = Utc::now();
        self.used_quota = 0;
        self.remaining_quota = self.total_quota;
        self.reset_at = self.quota_type.next_reset_at(now);
        self.warning_level = None;
        self.touch();
    }

    pub fn suspend(&mut self) {
        self.status = QuotaStatus::Suspended;
        self.updated_at = Utc::now();
    }

    pub fn activate(&mut self) {
        self.status = QuotaStatus::Active;
        self.touch();
    }

    /// Remaining fraction of the total in [0, 1]; 0 for an empty total
    pub fn remaining_ratio(&self) -> f64 {
        if self.total_quota == 0 {
            return 0.0;
        }
        self.remaining_quota as f64 / self.total_quota as f64
    }

    fn touch(&mut self) {
        self.refresh_status();
        self.updated_at = Utc::now();
    }

    // Suspension is only lifted by an explicit activate.
    fn refresh_status(&mut self) {
        if self.status == QuotaStatus::Suspended {
            return;
        }
        self.status = if self.remaining_quota == 0 {
            QuotaStatus::Exhausted
        } else {
            QuotaStatus::Active
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Consume,
    Restore,
    Recharge,
}

/// Immutable ledger entry
///
/// `amount` is positive for consumption and negative for restores and
/// recharges, which both raise the balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub quota_type: QuotaType,
    pub amount: i64,
    pub kind: TransactionKind,
    pub service: String,
    pub model: String,
    pub request_id: String,
    pub description: String,
    pub before_balance: u64,
    pub after_balance: u64,
    pub timestamp: DateTime<Utc>,
}

impl QuotaTransaction {
    pub fn new(
        kind: TransactionKind,
        before: &UserQuota,
        after: &UserQuota,
        amount: u64,
    ) -> Self {
        let magnitude = i64::try_from(amount).unwrap_or(i64::MAX);
        Self {
            id: Uuid::new_v4(),
            user_id: after.user_id.clone(),
            quota_type: after.quota_type,
            amount: match kind {
                TransactionKind::Consume => magnitude,
                TransactionKind::Restore | TransactionKind::Recharge => -magnitude,
            },
            kind,
            service: String::new(),
            model: String::new(),
            request_id: String::new(),
            description: String::new(),
            before_balance: before.remaining_quota,
            after_balance: after.remaining_quota,
            timestamp: Utc::now(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quota(total: u64) -> UserQuota {
        UserQuota::new("user-1", QuotaType::Daily, total, UserRole::Reader)
    }

    #[test]
    fn test_consume_then_insufficient() {
        let mut q = quota(100);
        q.consume(60).unwrap();
        let err = q.consume(50).unwrap_err();

        assert!(matches!(
            err,
            QuotaError::Insufficient {
                requested: 50,
                remaining: 40,
                ..
            }
        ));
        assert_eq!(q.remaining_quota, 40);
        assert_eq!(q.used_quota, 60);
    }

    #[test]
    fn test_exhausted_status() {
        let mut q = quota(10);
        q.consume(10).unwrap();
        assert_eq!(q.status, QuotaStatus::Exhausted);
        assert!(matches!(q.check(0), Err(QuotaError::Exhausted { .. })));

        q.restore(4);
        assert_eq!(q.status, QuotaStatus::Active);
        assert_eq!(q.remaining_quota, 4);
    }

    #[test]
    fn test_suspended_survives_balance_changes() {
        let mut q = quota(10);
        q.suspend();
        q.recharge(5);
        assert_eq!(q.status, QuotaStatus::Suspended);
        assert!(matches!(q.check(1), Err(QuotaError::Suspended { .. })));

        q.activate();
        assert!(q.check(1).is_ok());
    }

    #[test]
    fn test_restore_is_capped_by_usage() {
        let mut q = quota(100);
        q.consume(30).unwrap();
        assert_eq!(q.restore(50), 30);
        assert_eq!(q.remaining_quota, 100);
    }

    #[test]
    fn test_set_total_below_usage() {
        let mut q = quota(100);
        q.consume(80).unwrap();
        q.set_total(50);
        assert_eq!(q.used_quota, 50);
        assert_eq!(q.remaining_quota, 0);
        assert_eq!(q.status, QuotaStatus::Exhausted);
    }

    #[test]
    fn test_reset_clears_usage_and_alerts() {
        let mut q = quota(100);
        q.consume(95).unwrap();
        q.warning_level = Some(WarningLevel::Critical);
        let before = q.reset_at;

        q.reset();
        assert_eq!(q.remaining_quota, 100);
        assert!(q.warning_level.is_none());
        assert!(q.reset_at >= before);
    }

    #[test]
    fn test_warning_levels() {
        assert_eq!(WarningLevel::for_ratio(0.5, 0.2, 0.1), None);
        assert_eq!(
            WarningLevel::for_ratio(0.2, 0.2, 0.1),
            Some(WarningLevel::Warning)
        );
        assert_eq!(
            WarningLevel::for_ratio(0.05, 0.2, 0.1),
            Some(WarningLevel::Critical)
        );
        assert!(WarningLevel::Critical > WarningLevel::Warning);
    }

    #[test]
    fn test_transaction_sign() {
        let before = quota(100);
        let mut after = before.clone();
        after.consume(10).unwrap();

        let consume = QuotaTransaction::new(TransactionKind::Consume, &before, &after, 10);
        assert_eq!(consume.amount, 10);
        assert_eq!(consume.before_balance, 100);
        assert_eq!(consume.after_balance, 90);

        let restore = QuotaTransaction::new(TransactionKind::Restore, &after, &before, 10);
        assert_eq!(restore.amount, -10);
        assert_eq!(consume.amount + restore.amount, 0);
    }

    #[test]
    fn test_monthly_reset_is_later_than_daily() {
        let now = Utc::now();
        assert!(QuotaType::Monthly.next_reset_at(now) > QuotaType::Daily.next_reset_at(now));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Consume(u64),
        Restore(u64),
        Recharge(u64),
        SetTotal(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..200).prop_map(Op::Consume),
            (0u64..200).prop_map(Op::Restore),
            (0u64..50).prop_map(Op::Recharge),
            (0u64..300).prop_map(Op::SetTotal),
        ]
    }

    proptest! {
        #[test]
        fn prop_balance_invariant_holds(total in 0u64..500, ops in prop::collection::vec(op(), 0..64)) {
            let mut q = quota(total);
            for op in ops {
                let before = q.clone();
                match op {
                    Op::Consume(n) => {
                        if q.consume(n).is_err() {
                            prop_assert_eq!(&q, &before);
                        }
                    }
                    Op::Restore(n) => {
                        let restored = q.restore(n);
                        prop_assert!(restored <= n);
                    }
                    Op::Recharge(n) => q.recharge(n),
                    Op::SetTotal(n) => q.set_total(n),
                }
                prop_assert_eq!(q.remaining_quota, q.total_quota - q.used_quota);
                prop_assert!(q.used_quota <= q.total_quota);
            }
        }
    }
}
