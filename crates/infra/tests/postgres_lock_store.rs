//! Postgres lock store tests.
//!
//! Skipped unless `JOBGUARD_TEST_DATABASE_URL` points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use jobguard_core::{Clock, ManualClock};
use jobguard_infra::{LockManager, PostgresLockStore};

const TEN_MINUTES: Duration = Duration::from_secs(600);

async fn store() -> Option<PostgresLockStore> {
    let Ok(url) = std::env::var("JOBGUARD_TEST_DATABASE_URL") else {
        eprintln!("JOBGUARD_TEST_DATABASE_URL not set; skipping");
        return None;
    };
    let store = PostgresLockStore::connect(&url, 8).await.expect("connect");
    store.ensure_schema().await.expect("schema");
    Some(store)
}

/// Job names unique per test run so parallel runs never share rows.
fn job_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7())
}

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 13, 12, 0, 0).unwrap())
}

#[tokio::test]
async fn acquisition_is_exclusive_until_expiry() {
    let Some(store) = store().await else { return };
    let clock = clock();
    let locks = LockManager::with_clock(store, clock.clone());
    let job = job_name("weekly-aggregate");

    let first = locks.acquire_lock(&job, "2025-W03", TEN_MINUTES).await.unwrap().unwrap();
    assert_eq!(first.epoch, 1);
    assert!(locks.acquire_lock(&job, "2025-W03", TEN_MINUTES).await.unwrap().is_none());

    clock.advance(Duration::from_secs(11 * 60));
    let second = locks.acquire_lock(&job, "2025-W03", TEN_MINUTES).await.unwrap().unwrap();
    assert_eq!(second.epoch, 2);

    // The first holder's late release must not touch the new lease.
    assert!(!locks.release_lock(&first).await);
    assert!(locks.release_lock(&second).await);
    assert!(locks.inspect(&job, "2025-W03").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_get_exactly_one_grant() {
    let Some(store) = store().await else { return };
    let locks = Arc::new(LockManager::new(store));
    let job = job_name("ai-insights");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let locks = locks.clone();
        let job = job.clone();
        tasks.push(tokio::spawn(async move {
            locks.acquire_lock(&job, "berlin", TEN_MINUTES).await.unwrap()
        }));
    }

    let mut granted = Vec::new();
    for task in tasks {
        if let Some(lease) = task.await.unwrap() {
            granted.push(lease);
        }
    }
    assert_eq!(granted.len(), 1);
    assert!(locks.release_lock(&granted[0]).await);
}

#[tokio::test]
async fn renew_and_cleanup() {
    let Some(store) = store().await else { return };
    let clock = clock();
    let locks = LockManager::with_clock(store, clock.clone());
    let job = job_name("notify");

    let lease = locks.acquire_lock(&job, "warsaw", TEN_MINUTES).await.unwrap().unwrap();
    clock.advance(Duration::from_secs(5 * 60));
    let renewed = locks.renew_lock(&lease, TEN_MINUTES).await.unwrap().unwrap();
    assert_eq!(renewed.expires_at, clock.now() + chrono::Duration::minutes(10));

    clock.advance(Duration::from_secs(11 * 60));
    assert!(locks.cleanup_expired_locks().await.unwrap() >= 1);
    assert!(locks.inspect(&job, "warsaw").await.unwrap().is_none());
}
