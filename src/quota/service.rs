/*!
 * Per-user admission control and consumption ledger
 *
 * Every balance change for a user runs under that user's async mutex and is
 * persisted with an optimistic version check, so concurrent requests from the
 * same user never double-debit or lose an update. Different users never
 * contend with each other.
 */

use super::cache::{quota_cache_key, QuotaCache};
use super::error::{QuotaError, StoreError};
use super::events::{EventBus, QuotaEvent, QuotaWarningEvent};
use super::model::{QuotaTransaction, QuotaType, TransactionKind, UserQuota, UserRole, WarningLevel};
use super::repository::QuotaRepository;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Attempts at a read-modify-write before a version conflict is surfaced
const MAX_VERSION_RETRIES: usize = 3;

/// Tunables for [`QuotaService`]
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaSettings {
    /// Remaining fraction at or below which a warning event fires
    pub warning_threshold: f64,
    /// Remaining fraction at or below which a critical event fires
    pub critical_threshold: f64,
    pub cache_ttl: Duration,
    /// Quota period checked and debited for gateway requests
    pub quota_type: QuotaType,
    /// Role assumed when a first request lazily creates a quota
    pub default_role: UserRole,
    pub reader_quota: u64,
    pub author_quota: u64,
    pub admin_quota: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            warning_threshold: 0.20,
            critical_threshold: 0.10,
            cache_ttl: Duration::from_secs(300),
            quota_type: QuotaType::Daily,
            default_role: UserRole::Reader,
            reader_quota: 100,
            author_quota: 1000,
            admin_quota: 10000,
        }
    }
}

impl QuotaSettings {
    pub fn default_quota_for(&self, role: UserRole) -> u64 {
        match role {
            UserRole::Reader => self.reader_quota,
            UserRole::Author => self.author_quota,
            UserRole::Admin => self.admin_quota,
        }
    }
}

/// Quota admission, consumption and administration
pub struct QuotaService {
    repo: Arc<dyn QuotaRepository>,
    cache: Option<Arc<dyn QuotaCache>>,
    events: Option<Arc<dyn EventBus>>,
    settings: QuotaSettings,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for QuotaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaService")
            .field("settings", &self.settings)
            .field("cache", &self.cache.is_some())
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl QuotaService {
    pub fn new(repo: Arc<dyn QuotaRepository>, settings: QuotaSettings) -> Self {
        Self {
            repo,
            cache: None,
            events: None,
            settings,
            locks: DashMap::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn QuotaCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &QuotaSettings {
        &self.settings
    }

    /// Create the user's default quota if it does not exist yet
    ///
    /// Safe to race: a concurrent creator wins and both callers observe the
    /// same record.
    pub async fn initialize_user_quota(
        &self,
        user_id: &str,
        role: UserRole,
    ) -> Result<UserQuota, QuotaError> {
        let quota_type = self.settings.quota_type;
        if let Some(existing) = self.repo.get_quota_by_user_id(user_id, quota_type).await? {
            return Ok(existing);
        }

        let quota = UserQuota::new(
            user_id,
            quota_type,
            self.settings.default_quota_for(role),
            role,
        );
        match self.repo.create_quota(&quota).await {
            Ok(created) => {
                info!(
                    user_id,
                    role = role.as_str(),
                    total = created.total_quota,
                    "Initialized user quota"
                );
                Ok(created)
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(user_id, "Quota created concurrently, re-reading");
                self.load(user_id, quota_type).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Admit a request that will cost about `amount`
    ///
    /// A user seen for the first time gets a default quota.
    pub async fn check_quota(&self, user_id: &str, amount: u64) -> Result<UserQuota, QuotaError> {
        let quota = match self.get_quota_info(user_id).await {
            Ok(quota) => quota,
            Err(QuotaError::NotFound { .. }) => {
                self.initialize_user_quota(user_id, self.settings.default_role)
                    .await?
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = quota.check(amount) {
            debug!(user_id, amount, error = %e, "Quota check rejected");
            return Err(e);
        }
        Ok(quota)
    }

    /// Debit `amount` and append a consume entry to the ledger
    pub async fn consume_quota(
        &self,
        user_id: &str,
        amount: u64,
        service: &str,
        model: &str,
        request_id: &str,
    ) -> Result<UserQuota, QuotaError> {
        let quota_type = self.settings.quota_type;
        let _guard = self.lock_user(user_id).await;

        let (before, after, ()) = self
            .modify(user_id, quota_type, |quota| quota.consume(amount))
            .await?;

        let transaction = QuotaTransaction::new(TransactionKind::Consume, &before, &after, amount)
            .with_service(service)
            .with_model(model)
            .with_request(request_id)
            .with_description(format!("consumed {amount} for {service}"));
        self.append_or_revert(&transaction, &before).await?;

        let after = self.publish_warning_if_crossed(after).await;
        debug!(
            user_id,
            amount,
            remaining = after.remaining_quota,
            request_id,
            "Quota consumed"
        );
        Ok(after)
    }

    /// Credit back up to `amount` of earlier consumption
    ///
    /// The ledger records the amount actually restored.
    pub async fn restore_quota(
        &self,
        user_id: &str,
        amount: u64,
        reason: &str,
    ) -> Result<UserQuota, QuotaError> {
        let quota_type = self.settings.quota_type;
        let _guard = self.lock_user(user_id).await;

        let (before, after, restored) = self
            .modify(user_id, quota_type, |quota| Ok(quota.restore(amount)))
            .await?;

        if restored < amount {
            warn!(user_id, requested = amount, restored, "Restore capped by usage");
        }

        let transaction = QuotaTransaction::new(TransactionKind::Restore, &before, &after, restored)
            .with_service("system")
            .with_description(reason);
        self.append_or_revert(&transaction, &before).await?;

        let after = self.clear_recovered_warning(after).await;
        debug!(user_id, restored, remaining = after.remaining_quota, "Quota restored");
        Ok(after)
    }

    /// Current quota record, served from the cache when possible
    ///
    /// A miss is filled under the user's lock, the same lock writers hold
    /// across write and invalidation, so a fill never caches a record that a
    /// concurrent write has already replaced.
    pub async fn get_quota_info(&self, user_id: &str) -> Result<UserQuota, QuotaError> {
        let quota_type = self.settings.quota_type;
        if self.cache.is_none() {
            return self.load(user_id, quota_type).await;
        }

        if let Some(quota) = self.cached(user_id, quota_type).await {
            return Ok(quota);
        }

        let _guard = self.lock_user(user_id).await;
        if let Some(quota) = self.cached(user_id, quota_type).await {
            return Ok(quota);
        }
        let quota = self.load(user_id, quota_type).await?;
        self.cache_quota(&quota).await;
        Ok(quota)
    }

    pub async fn get_all_quotas(&self, user_id: &str) -> Result<Vec<UserQuota>, QuotaError> {
        Ok(self.repo.get_all_quotas_by_user_id(user_id).await?)
    }

    /// Ledger entries for a user, newest first
    pub async fn get_transaction_history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QuotaTransaction>, QuotaError> {
        Ok(self
            .repo
            .get_transactions_by_user_id(user_id, limit, offset)
            .await?)
    }

    /// Reset every daily quota; returns the number of records reset
    pub async fn reset_daily_quotas(&self) -> Result<usize, QuotaError> {
        self.reset_quotas(QuotaType::Daily).await
    }

    pub async fn reset_monthly_quotas(&self) -> Result<usize, QuotaError> {
        self.reset_quotas(QuotaType::Monthly).await
    }

    /// Set a user's total, creating the record if absent
    pub async fn update_user_quota(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        total_quota: u64,
    ) -> Result<UserQuota, QuotaError> {
        let _guard = self.lock_user(user_id).await;

        if self
            .repo
            .get_quota_by_user_id(user_id, quota_type)
            .await?
            .is_none()
        {
            let quota = UserQuota::new(user_id, quota_type, total_quota, self.settings.default_role);
            match self.repo.create_quota(&quota).await {
                Ok(created) => {
                    info!(user_id, %quota_type, total_quota, "Created quota");
                    return Ok(created);
                }
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let (_, after, ()) = self
            .modify(user_id, quota_type, |quota| {
                quota.set_total(total_quota);
                Ok(())
            })
            .await?;
        info!(user_id, %quota_type, total_quota, "Updated quota total");
        Ok(self.clear_recovered_warning(after).await)
    }

    /// Suspend every quota the user holds
    pub async fn suspend_user_quota(&self, user_id: &str) -> Result<Vec<UserQuota>, QuotaError> {
        let updated = self
            .modify_all(user_id, |quota| quota.suspend())
            .await?;
        info!(user_id, quotas = updated.len(), "Suspended user quota");
        Ok(updated)
    }

    pub async fn activate_user_quota(&self, user_id: &str) -> Result<Vec<UserQuota>, QuotaError> {
        let updated = self
            .modify_all(user_id, |quota| quota.activate())
            .await?;
        info!(user_id, quotas = updated.len(), "Activated user quota");
        Ok(updated)
    }

    /// Grow the user's total and balance by `amount`
    pub async fn recharge_quota(
        &self,
        user_id: &str,
        amount: u64,
        reason: &str,
        operator_id: &str,
    ) -> Result<UserQuota, QuotaError> {
        if amount == 0 {
            return Err(QuotaError::InvalidAmount(
                "recharge amount must be greater than 0".to_string(),
            ));
        }

        let quota_type = self.settings.quota_type;
        let _guard = self.lock_user(user_id).await;

        let (before, after, ()) = self
            .modify(user_id, quota_type, |quota| {
                quota.recharge(amount);
                Ok(())
            })
            .await?;

        let transaction = QuotaTransaction::new(TransactionKind::Recharge, &before, &after, amount)
            .with_service("system")
            .with_request(operator_id)
            .with_description(reason);
        self.append_or_revert(&transaction, &before).await?;

        info!(user_id, amount, operator_id, "Quota recharged");
        Ok(self.clear_recovered_warning(after).await)
    }

    async fn reset_quotas(&self, quota_type: QuotaType) -> Result<usize, QuotaError> {
        let users = self.repo.batch_reset_quotas(quota_type).await?;
        for user_id in &users {
            // Waits out any in-flight cache fill that read the pre-reset record
            let _guard = self.lock_user(user_id).await;
            self.invalidate(user_id, quota_type).await;
        }
        info!(%quota_type, count = users.len(), "Quotas reset");
        Ok(users.len())
    }

    async fn load(&self, user_id: &str, quota_type: QuotaType) -> Result<UserQuota, QuotaError> {
        self.repo
            .get_quota_by_user_id(user_id, quota_type)
            .await?
            .ok_or_else(|| QuotaError::NotFound {
                user_id: user_id.to_string(),
                quota_type,
            })
    }

    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Read-modify-write with optimistic retry
    ///
    /// Returns the record before and after the change plus `f`'s output. The
    /// cache entry is invalidated after every successful write.
    async fn modify<T, F>(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        mut f: F,
    ) -> Result<(UserQuota, UserQuota, T), QuotaError>
    where
        F: FnMut(&mut UserQuota) -> Result<T, QuotaError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let before = self.load(user_id, quota_type).await?;
            let mut next = before.clone();
            let output = f(&mut next)?;

            match self.repo.update_quota(&next).await {
                Ok(stored) => {
                    self.invalidate(user_id, quota_type).await;
                    return Ok((before, stored, output));
                }
                Err(StoreError::VersionConflict { .. }) if attempt < MAX_VERSION_RETRIES => {
                    debug!(user_id, attempt, "Version conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Append a ledger entry, undoing the balance change if the append fails
    ///
    /// Callers hold the user's lock, so the record still equals the post-write
    /// state and putting back `before`'s balance restores it exactly.
    async fn append_or_revert(
        &self,
        transaction: &QuotaTransaction,
        before: &UserQuota,
    ) -> Result<(), QuotaError> {
        let Err(e) = self.repo.create_transaction(transaction).await else {
            return Ok(());
        };

        warn!(
            user_id = %before.user_id,
            kind = ?transaction.kind,
            error = %e,
            "Ledger write failed, reverting balance"
        );
        let reverted = self
            .modify(&before.user_id, before.quota_type, |quota| {
                quota.total_quota = before.total_quota;
                quota.used_quota = before.used_quota;
                quota.remaining_quota = before.remaining_quota;
                quota.status = before.status;
                Ok(())
            })
            .await;
        if let Err(revert) = reverted {
            warn!(
                user_id = %before.user_id,
                error = %revert,
                "Balance revert failed after ledger error"
            );
        }
        Err(e.into())
    }

    async fn modify_all<F>(&self, user_id: &str, f: F) -> Result<Vec<UserQuota>, QuotaError>
    where
        F: Fn(&mut UserQuota),
    {
        let _guard = self.lock_user(user_id).await;
        let quotas = self.repo.get_all_quotas_by_user_id(user_id).await?;
        if quotas.is_empty() {
            return Err(QuotaError::NotFound {
                user_id: user_id.to_string(),
                quota_type: self.settings.quota_type,
            });
        }

        let mut updated = Vec::with_capacity(quotas.len());
        for quota in quotas {
            let (_, after, ()) = self
                .modify(user_id, quota.quota_type, |q| {
                    f(q);
                    Ok(())
                })
                .await?;
            updated.push(after);
        }
        Ok(updated)
    }

    /// Publish a warning the first time the balance crosses a threshold
    ///
    /// The published level is stored on the record so repeated consumption in
    /// the same band stays silent.
    async fn publish_warning_if_crossed(&self, quota: UserQuota) -> UserQuota {
        let Some(level) = self.level_for(&quota) else {
            return quota;
        };
        if quota.warning_level.is_some_and(|published| published >= level) {
            return quota;
        }

        if let Some(bus) = &self.events {
            bus.publish_async(QuotaEvent::Warning(QuotaWarningEvent::from_quota(
                &quota, level,
            )));
        }
        warn!(
            user_id = %quota.user_id,
            level = level.as_str(),
            remaining = quota.remaining_quota,
            total = quota.total_quota,
            "Quota threshold crossed"
        );

        self.store_warning_level(quota, Some(level)).await
    }

    /// Lower the stored alert level after the balance rose
    async fn clear_recovered_warning(&self, quota: UserQuota) -> UserQuota {
        let level = self.level_for(&quota);
        if quota.warning_level <= level {
            return quota;
        }
        self.store_warning_level(quota, level).await
    }

    fn level_for(&self, quota: &UserQuota) -> Option<WarningLevel> {
        if quota.total_quota == 0 {
            return None;
        }
        WarningLevel::for_ratio(
            quota.remaining_ratio(),
            self.settings.warning_threshold,
            self.settings.critical_threshold,
        )
    }

    // Losing this write only risks a duplicate alert, so failures are logged.
    async fn store_warning_level(
        &self,
        quota: UserQuota,
        level: Option<WarningLevel>,
    ) -> UserQuota {
        let mut next = quota.clone();
        next.warning_level = level;
        match self.repo.update_quota(&next).await {
            Ok(stored) => {
                self.invalidate(&stored.user_id, stored.quota_type).await;
                stored
            }
            Err(e) => {
                warn!(user_id = %quota.user_id, error = %e, "Failed to store warning level");
                quota
            }
        }
    }

    async fn cached(&self, user_id: &str, quota_type: QuotaType) -> Option<UserQuota> {
        let cache = self.cache.as_ref()?;
        let key = quota_cache_key(user_id, quota_type);
        match cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<UserQuota>(&cached) {
                Ok(quota) => return Some(quota),
                Err(e) => warn!(key = %key, error = %e, "Discarding undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Quota cache read failed"),
        }
        None
    }

    async fn cache_quota(&self, quota: &UserQuota) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = quota_cache_key(&quota.user_id, quota.quota_type);
        let value = match serde_json::to_string(quota) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode quota for cache");
                return;
            }
        };
        if let Err(e) = cache.set(&key, value, self.settings.cache_ttl).await {
            warn!(key = %key, error = %e, "Quota cache write failed");
        }
    }

    async fn invalidate(&self, user_id: &str, quota_type: QuotaType) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = quota_cache_key(user_id, quota_type);
        if let Err(e) = cache.delete(&key).await {
            warn!(key = %key, error = %e, "Quota cache invalidation failed");
        }
    }
}
