/*!
 * Quota persistence interface and an in-memory implementation
 */

use super::error::StoreError;
use super::model::{QuotaTransaction, QuotaType, UserQuota};
use async_trait::async_trait;
use dashmap::DashMap;

/// Storage backend for quota records and the transaction ledger
#[async_trait]
pub trait QuotaRepository: Send + Sync {
    async fn get_quota_by_user_id(
        &self,
        user_id: &str,
        quota_type: QuotaType,
    ) -> Result<Option<UserQuota>, StoreError>;

    /// Insert a new record; fails with `AlreadyExists` if one is present
    async fn create_quota(&self, quota: &UserQuota) -> Result<UserQuota, StoreError>;

    /// Compare-and-swap on `quota.version`
    ///
    /// Returns the stored record with its version incremented.
    async fn update_quota(&self, quota: &UserQuota) -> Result<UserQuota, StoreError>;

    async fn create_transaction(&self, transaction: &QuotaTransaction) -> Result<(), StoreError>;

    async fn get_all_quotas_by_user_id(&self, user_id: &str) -> Result<Vec<UserQuota>, StoreError>;

    /// Newest first
    async fn get_transactions_by_user_id(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QuotaTransaction>, StoreError>;

    /// Start a new period for every quota of `quota_type`
    ///
    /// Returns the IDs of the users whose records were reset.
    async fn batch_reset_quotas(&self, quota_type: QuotaType) -> Result<Vec<String>, StoreError>;
}

/// Process-local repository backed by concurrent maps
#[derive(Debug, Default)]
pub struct InMemoryQuotaRepository {
    quotas: DashMap<(String, QuotaType), UserQuota>,
    /// Oldest first per user
    transactions: DashMap<String, Vec<QuotaTransaction>>,
}

impl InMemoryQuotaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ledger entry for a user, oldest first
    pub fn ledger(&self, user_id: &str) -> Vec<QuotaTransaction> {
        self.transactions
            .get(user_id)
            .map(|t| t.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaRepository for InMemoryQuotaRepository {
    async fn get_quota_by_user_id(
        &self,
        user_id: &str,
        quota_type: QuotaType,
    ) -> Result<Option<UserQuota>, StoreError> {
        Ok(self
            .quotas
            .get(&(user_id.to_string(), quota_type))
            .map(|q| q.value().clone()))
    }

    async fn create_quota(&self, quota: &UserQuota) -> Result<UserQuota, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self
            .quotas
            .entry((quota.user_id.clone(), quota.quota_type))
        {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                user_id: quota.user_id.clone(),
                quota_type: quota.quota_type,
            }),
            Entry::Vacant(slot) => {
                let mut stored = quota.clone();
                stored.version = 1;
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_quota(&self, quota: &UserQuota) -> Result<UserQuota, StoreError> {
        let key = (quota.user_id.clone(), quota.quota_type);
        let mut current = self
            .quotas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                user_id: quota.user_id.clone(),
                quota_type: quota.quota_type,
            })?;

        if current.version != quota.version {
            return Err(StoreError::VersionConflict {
                user_id: quota.user_id.clone(),
                expected: quota.version,
                found: current.version,
            });
        }

        let mut stored = quota.clone();
        stored.version += 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn create_transaction(&self, transaction: &QuotaTransaction) -> Result<(), StoreError> {
        self.transactions
            .entry(transaction.user_id.clone())
            .or_default()
            .push(transaction.clone());
        Ok(())
    }

    async fn get_all_quotas_by_user_id(&self, user_id: &str) -> Result<Vec<UserQuota>, StoreError> {
        let mut quotas: Vec<_> = self
            .quotas
            .iter()
            .filter(|q| q.key().0 == user_id)
            .map(|q| q.value().clone())
            .collect();
        quotas.sort_by_key(|q| q.quota_type.as_str());
        Ok(quotas)
    }

    async fn get_transactions_by_user_id(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QuotaTransaction>, StoreError> {
        Ok(self
            .transactions
            .get(user_id)
            .map(|t| {
                t.value()
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_reset_quotas(&self, quota_type: QuotaType) -> Result<Vec<String>, StoreError> {
        let mut reset = Vec::new();
        for mut entry in self.quotas.iter_mut() {
            if entry.key().1 != quota_type {
                continue;
            }
            let quota = entry.value_mut();
            quota.reset();
            quota.version += 1;
            reset.push(quota.user_id.clone());
        }
        reset.sort();
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::model::{TransactionKind, UserRole};

    fn quota(user: &str) -> UserQuota {
        UserQuota::new(user, QuotaType::Daily, 100, UserRole::Reader)
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let repo = InMemoryQuotaRepository::new();
        let stored = repo.create_quota(&quota("u1")).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = repo.create_quota(&quota("u1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let repo = InMemoryQuotaRepository::new();
        let stored = repo.create_quota(&quota("u1")).await.unwrap();

        let mut first = stored.clone();
        first.consume(10).unwrap();
        let updated = repo.update_quota(&first).await.unwrap();
        assert_eq!(updated.version, 2);

        let mut stale = stored;
        stale.consume(20).unwrap();
        let err = repo.update_quota(&stale).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                user_id: "u1".into(),
                expected: 1,
                found: 2
            }
        );

        let current = repo
            .get_quota_by_user_id("u1", QuotaType::Daily)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.remaining_quota, 90);
    }

    #[tokio::test]
    async fn test_update_missing() {
        let repo = InMemoryQuotaRepository::new();
        let err = repo.update_quota(&quota("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_transactions_paging_newest_first() {
        let repo = InMemoryQuotaRepository::new();
        let q = quota("u1");
        for i in 0..5 {
            let tx = QuotaTransaction::new(TransactionKind::Consume, &q, &q, i)
                .with_request(format!("req-{i}"));
            repo.create_transaction(&tx).await.unwrap();
        }

        let page = repo.get_transactions_by_user_id("u1", 2, 1).await.unwrap();
        let ids: Vec<_> = page.iter().map(|t| t.request_id.as_str()).collect();
        assert_eq!(ids, vec!["req-3", "req-2"]);
        assert!(repo
            .get_transactions_by_user_id("nobody", 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_batch_reset_only_touches_type() {
        let repo = InMemoryQuotaRepository::new();
        let mut daily = repo.create_quota(&quota("u1")).await.unwrap();
        daily.consume(70).unwrap();
        repo.update_quota(&daily).await.unwrap();

        let mut monthly = UserQuota::new("u1", QuotaType::Monthly, 1000, UserRole::Reader);
        monthly.consume(500).unwrap();
        repo.create_quota(&monthly).await.unwrap();

        let reset = repo.batch_reset_quotas(QuotaType::Daily).await.unwrap();
        assert_eq!(reset, vec!["u1".to_string()]);

        let all = repo.get_all_quotas_by_user_id("u1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].quota_type, QuotaType::Daily);
        assert_eq!(all[0].remaining_quota, 100);
        assert_eq!(all[0].version, 3);
        assert_eq!(all[1].remaining_quota, 500);
    }
}
