//! Quota linearizability under concurrent requests from the same user

use aigate::quota::{
    InMemoryCache, InMemoryQuotaRepository, QuotaError, QuotaService, QuotaSettings, QuotaType,
    TransactionKind,
};
use std::sync::Arc;

async fn service_with(user: &str, total: u64) -> (Arc<QuotaService>, Arc<InMemoryQuotaRepository>) {
    let repo = Arc::new(InMemoryQuotaRepository::new());
    let service = Arc::new(
        QuotaService::new(repo.clone(), QuotaSettings::default())
            .with_cache(Arc::new(InMemoryCache::new())),
    );
    service
        .update_user_quota(user, QuotaType::Daily, total)
        .await
        .unwrap();
    (service, repo)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overdraw_admits_exactly_one() {
    for _ in 0..50 {
        let (service, _) = service_with("alice", 100).await;

        let a = {
            let s = service.clone();
            tokio::spawn(async move { s.consume_quota("alice", 60, "svc", "m", "r-60").await })
        };
        let b = {
            let s = service.clone();
            tokio::spawn(async move { s.consume_quota("alice", 50, "svc", "m", "r-50").await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let insufficient = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(QuotaError::Insufficient { .. })))
            .count();
        assert_eq!(insufficient, 1, "a={a:?} b={b:?}");

        let quota = service.get_quota_info("alice").await.unwrap();
        let expected = if a.is_ok() { 40 } else { 50 };
        assert_eq!(quota.remaining_quota, expected);
        assert_eq!(quota.remaining_quota, quota.total_quota - quota.used_quota);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_small_consumers_never_lose_updates() {
    let (service, repo) = service_with("bob", 1000).await;

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let s = service.clone();
            tokio::spawn(async move {
                s.consume_quota("bob", 7, "svc", "m", &format!("r-{i}"))
                    .await
            })
        })
        .collect();

    let mut ok = 0u64;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    // 100 * 7 fits in 1000.
    assert_eq!(ok, 100);
    let quota = service.get_quota_info("bob").await.unwrap();
    assert_eq!(quota.used_quota, 700);
    assert_eq!(repo.ledger("bob").len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_checks_create_one_record() {
    let repo = Arc::new(InMemoryQuotaRepository::new());
    let service = Arc::new(QuotaService::new(repo.clone(), QuotaSettings::default()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let s = service.clone();
            tokio::spawn(async move { s.check_quota("newcomer", 1).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let quotas = service.get_all_quotas("newcomer").await.unwrap();
    assert_eq!(quotas.len(), 1);
    assert_eq!(quotas[0].total_quota, 100);
}

#[tokio::test]
async fn consume_then_restore_nets_to_zero() {
    let (service, repo) = service_with("carol", 100).await;

    service
        .consume_quota("carol", 30, "svc", "m", "r-1")
        .await
        .unwrap();
    let after = service
        .restore_quota("carol", 30, "rollback")
        .await
        .unwrap();
    assert_eq!(after.remaining_quota, 100);

    let ledger = repo.ledger("carol");
    let kinds: Vec<_> = ledger.iter().map(|t| t.kind).collect();
    assert!(kinds.contains(&TransactionKind::Consume));
    assert!(kinds.contains(&TransactionKind::Restore));
    assert_eq!(ledger.iter().map(|t| t.amount).sum::<i64>(), 0);
}
