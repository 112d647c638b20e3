//! Lease-based mutual exclusion for named background jobs.
//!
//! `LockManager` guarantees that at most one caller, across every process
//! sharing the same `LockStore`, holds a live lease on a given
//! `(job_name, key)` pair. Duplicate triggers of the same job simply skip.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use jobguard_core::lock::lease_expiry;
use jobguard_core::{Clock, Lease, LeaseToken, LockId, LockRecord, SystemClock};

use super::store::{LockStore, LockStoreError};

/// Lease granted when the caller has no better estimate (10 minutes).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(10 * 60);

/// Result of `LockManager::with_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the job ran to completion.
    Completed(T),
    /// Another holder had a live lease; the job was not started.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, LockOutcome::Skipped)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            LockOutcome::Completed(value) => Some(value),
            LockOutcome::Skipped => None,
        }
    }
}

/// Failure of `LockManager::with_lock`.
///
/// Contention is not represented here; see `LockOutcome::Skipped`.
#[derive(Debug, Error)]
pub enum WithLockError<E> {
    /// The store failed while acquiring; the job did not run.
    #[error("failed to acquire lock: {0}")]
    Store(#[source] LockStoreError),

    /// The job itself failed. The lease has been released.
    #[error("job failed: {0}")]
    Job(E),
}

/// Coordinates lease acquisition and release over a shared `LockStore`.
pub struct LockManager<S, C = SystemClock> {
    store: Arc<S>,
    clock: C,
    default_lease: Duration,
}

impl<S> LockManager<S, SystemClock>
where
    S: LockStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S, C> LockManager<S, C>
where
    S: LockStore + 'static,
    C: Clock,
{
    pub fn with_clock(store: S, clock: C) -> Self {
        Self {
            store: Arc::new(store),
            clock,
            default_lease: DEFAULT_LEASE,
        }
    }

    /// Override the lease used by `with_default_lease`.
    pub fn default_lease_of(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try to take exclusive ownership of `(job_name, key)` for `lease`.
    ///
    /// - `Ok(Some(lease))`: granted (no row existed, or the previous lease expired).
    /// - `Ok(None)`: a live lease is held elsewhere.
    /// - `Err(_)`: the store failed; treat as not acquired.
    ///
    /// One round trip to the store for the grant itself; never waits for the
    /// current holder.
    pub async fn acquire_lock(
        &self,
        job_name: &str,
        key: &str,
        lease: Duration,
    ) -> Result<Option<Lease>, LockStoreError> {
        let id = LockId::new(job_name, key)?;
        let now = self.clock.now();
        let expires_at = lease_expiry(now, lease)?;

        let granted = match self
            .store
            .try_acquire(&id, LeaseToken::new(), now, expires_at)
            .await
        {
            Ok(granted) => granted,
            Err(err) => {
                error!(job_name, key, error = %err, "failed to acquire lock");
                return Err(err);
            }
        };

        match granted {
            Some(record) => {
                info!(
                    job_name,
                    key,
                    epoch = record.epoch,
                    expires_at = %record.expires_at,
                    "lock acquired"
                );
                Ok(Some(record.into()))
            }
            None => {
                // Diagnostics only; the refusal above is authoritative.
                match self.store.get(&id).await {
                    Ok(Some(holder)) => warn!(
                        job_name,
                        key,
                        started_at = %holder.started_at,
                        expires_at = %holder.expires_at,
                        "job already running"
                    ),
                    _ => warn!(job_name, key, "job already running"),
                }
                Ok(None)
            }
        }
    }

    /// Give the lease back.
    ///
    /// Deletes the row only if it still carries this lease's token, so a
    /// holder whose lease already expired and was reclaimed cannot remove
    /// the new holder's lock. Returns whether a row was removed. Store
    /// failures are logged and swallowed: the lease then lapses on its own.
    pub async fn release_lock(&self, lease: &Lease) -> bool {
        release_with(&*self.store, lease).await
    }

    /// Extend a lease that is still live and still ours.
    ///
    /// `Ok(None)` when the lease expired or was reclaimed in the meantime.
    pub async fn renew_lock(
        &self,
        lease: &Lease,
        extend_by: Duration,
    ) -> Result<Option<Lease>, LockStoreError> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, extend_by)?;

        let renewed = self
            .store
            .renew(&lease.id, lease.token, now, expires_at)
            .await?;

        match &renewed {
            Some(record) => info!(
                job_name = lease.job_name(),
                key = lease.key(),
                epoch = record.epoch,
                expires_at = %record.expires_at,
                "lock renewed"
            ),
            None => warn!(
                job_name = lease.job_name(),
                key = lease.key(),
                epoch = lease.epoch,
                "lock renewal refused: lease expired or reclaimed"
            ),
        }

        Ok(renewed.map(Lease::from))
    }

    /// Current row for `(job_name, key)`, which may already be expired.
    pub async fn inspect(
        &self,
        job_name: &str,
        key: &str,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        let id = LockId::new(job_name, key)?;
        self.store.get(&id).await
    }

    /// Run `job` under the lock, or skip it if the lock is held elsewhere.
    ///
    /// The lease is released on every exit path: after `job` returns `Ok` or
    /// `Err`, and (best-effort, on the ambient tokio runtime) if this future
    /// is dropped mid-flight or `job` panics.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        job_name: &str,
        key: &str,
        lease: Duration,
        job: F,
    ) -> Result<LockOutcome<T>, WithLockError<E>>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let granted = self
            .acquire_lock(job_name, key, lease)
            .await
            .map_err(WithLockError::Store)?;

        let Some(granted) = granted else {
            warn!(job_name, key, "skipping job execution - already running");
            return Ok(LockOutcome::Skipped);
        };

        let guard = ReleaseGuard::new(self.store.clone(), granted.clone());
        let result = job(granted).await;

        if let Err(err) = &result {
            error!(job_name, key, error = %err, "job execution failed");
        }
        if let Some(granted) = guard.disarm() {
            self.release_lock(&granted).await;
        }

        result.map(LockOutcome::Completed).map_err(WithLockError::Job)
    }

    /// `with_lock` using the manager's default lease.
    pub async fn with_default_lease<T, E, F, Fut>(
        &self,
        job_name: &str,
        key: &str,
        job: F,
    ) -> Result<LockOutcome<T>, WithLockError<E>>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.with_lock(job_name, key, self.default_lease, job).await
    }

    /// Delete rows whose lease expired before now; returns how many.
    ///
    /// Pure housekeeping: acquisition already treats expired rows as absent.
    pub async fn cleanup_expired_locks(&self) -> Result<u64, LockStoreError> {
        let now = self.clock.now();
        match self.store.delete_expired(now).await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "cleaned up expired locks");
                }
                Ok(count)
            }
            Err(err) => {
                error!(error = %err, "failed to clean up expired locks");
                Err(err)
            }
        }
    }
}

async fn release_with<S>(store: &S, lease: &Lease) -> bool
where
    S: LockStore + ?Sized,
{
    match store.release(&lease.id, lease.token).await {
        Ok(true) => {
            info!(job_name = lease.job_name(), key = lease.key(), epoch = lease.epoch, "lock released");
            true
        }
        Ok(false) => {
            warn!(
                job_name = lease.job_name(),
                key = lease.key(),
                epoch = lease.epoch,
                "lock already gone or reclaimed; nothing released"
            );
            false
        }
        Err(err) => {
            error!(
                job_name = lease.job_name(),
                key = lease.key(),
                error = %err,
                "failed to release lock"
            );
            false
        }
    }
}

/// Releases the lease from `Drop` unless disarmed.
struct ReleaseGuard<S>
where
    S: LockStore + 'static,
{
    store: Arc<S>,
    lease: Option<Lease>,
}

impl<S> ReleaseGuard<S>
where
    S: LockStore + 'static,
{
    fn new(store: Arc<S>, lease: Lease) -> Self {
        Self {
            store,
            lease: Some(lease),
        }
    }

    fn disarm(mut self) -> Option<Lease> {
        self.lease.take()
    }
}

impl<S> Drop for ReleaseGuard<S>
where
    S: LockStore + 'static,
{
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        // Without a runtime the lease simply lapses at expiry.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                job_name = lease.job_name(),
                key = lease.key(),
                "job abandoned outside a runtime; lock will lapse at expiry"
            );
            return;
        };

        let store = self.store.clone();
        handle.spawn(async move {
            release_with(&*store, &lease).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use jobguard_core::{IsoWeek, ManualClock};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 13, 12, 0, 0).unwrap())
    }

    fn manager(clock: &ManualClock) -> LockManager<InMemoryLockStore, ManualClock> {
        LockManager::with_clock(InMemoryLockStore::new(), clock.clone())
    }

    /// Delegates to an in-memory store but can fail on demand.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryLockStore,
        fail_acquire: AtomicBool,
        fail_release: AtomicBool,
    }

    fn outage(op: &str) -> LockStoreError {
        LockStoreError::Unavailable(format!("{op}: connection refused"))
    }

    #[async_trait]
    impl LockStore for FlakyStore {
        async fn try_acquire(
            &self,
            id: &LockId,
            token: LeaseToken,
            now: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> Result<Option<LockRecord>, LockStoreError> {
            if self.fail_acquire.load(Ordering::SeqCst) {
                return Err(outage("try_acquire"));
            }
            self.inner.try_acquire(id, token, now, expires_at).await
        }

        async fn release(&self, id: &LockId, token: LeaseToken) -> Result<bool, LockStoreError> {
            if self.fail_release.load(Ordering::SeqCst) {
                return Err(outage("release"));
            }
            self.inner.release(id, token).await
        }

        async fn renew(
            &self,
            id: &LockId,
            token: LeaseToken,
            now: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> Result<Option<LockRecord>, LockStoreError> {
            self.inner.renew(id, token, now, expires_at).await
        }

        async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
            self.inner.get(id).await
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LockStoreError> {
            self.inner.delete_expired(now).await
        }
    }

    #[tokio::test]
    async fn weekly_aggregate_scenario() {
        let clock = clock();
        let locks = manager(&clock);

        let first = locks
            .acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = locks
            .acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES)
            .await
            .unwrap();
        assert!(second.is_none());

        clock.advance(Duration::from_secs(11 * 60));
        assert_eq!(locks.cleanup_expired_locks().await.unwrap(), 1);

        let third = locks
            .acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES)
            .await
            .unwrap()
            .unwrap();
        // Cleanup removed the row, so this is a fresh first grant.
        assert_eq!(third.epoch, 1);
        assert_eq!(third.started_at, clock.now());
    }

    #[tokio::test]
    async fn default_lease_governs_with_default_lease() {
        let clock = clock();
        let locks = manager(&clock).default_lease_of(Duration::from_secs(90));
        let started = clock.now();

        let lease = locks
            .with_default_lease("notify", "berlin", |lease| async move { Ok::<_, String>(lease) })
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(lease.expires_at, started + chrono::Duration::seconds(90));

        // A default-length lease blocks until exactly its expiry.
        let held = locks.acquire_lock("notify", "berlin", locks.default_lease()).await.unwrap().unwrap();
        assert_eq!(held.expires_at, started + chrono::Duration::seconds(90));

        clock.advance(Duration::from_secs(89));
        let outcome = locks
            .with_default_lease("notify", "berlin", |_| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert!(outcome.is_skipped());

        clock.advance(Duration::from_secs(1));
        let outcome = locks
            .with_default_lease("notify", "berlin", |lease| async move {
                Ok::<_, String>(lease.expires_at)
            })
            .await
            .unwrap();
        assert_eq!(outcome.completed(), Some(clock.now() + chrono::Duration::seconds(90)));
    }

    #[tokio::test]
    async fn weekly_keys_come_from_iso_weeks() {
        let clock = clock();
        let locks = manager(&clock);
        let week = IsoWeek::current(&clock);
        let id = LockId::weekly("weekly-aggregate", week).unwrap();
        assert_eq!(id.key(), "2025-W03");

        let lease = locks.acquire_lock(id.job_name(), id.key(), TEN_MINUTES).await.unwrap().unwrap();
        assert_eq!(lease.id, id);

        // Last week's partition is independent.
        let last = LockId::weekly("weekly-aggregate", week.previous()).unwrap();
        assert!(locks.acquire_lock(last.job_name(), last.key(), TEN_MINUTES).await.unwrap().is_some());
        assert!(locks.acquire_lock(id.job_name(), id.key(), TEN_MINUTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_without_cleanup() {
        let clock = clock();
        let locks = manager(&clock);

        let first = locks.acquire_lock("ai-insights", "berlin", TEN_MINUTES).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11 * 60));

        let reclaimed = locks.acquire_lock("ai-insights", "berlin", TEN_MINUTES).await.unwrap().unwrap();
        assert_eq!(reclaimed.epoch, first.epoch + 1);
        assert_ne!(reclaimed.token, first.token);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let clock = clock();
        let locks = manager(&clock);

        assert!(locks.acquire_lock("notify", "berlin", TEN_MINUTES).await.unwrap().is_some());
        assert!(locks.acquire_lock("notify", "warsaw", TEN_MINUTES).await.unwrap().is_some());
        assert!(locks.acquire_lock("ai-insights", "berlin", TEN_MINUTES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_makes_lock_available_and_is_idempotent() {
        let clock = clock();
        let locks = manager(&clock);

        let lease = locks.acquire_lock("notify", "berlin", TEN_MINUTES).await.unwrap().unwrap();
        assert!(locks.release_lock(&lease).await);
        assert!(!locks.release_lock(&lease).await);

        assert!(locks.acquire_lock("notify", "berlin", TEN_MINUTES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_release_does_not_remove_reclaimed_lease() {
        let clock = clock();
        let locks = manager(&clock);

        let stale = locks.acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11 * 60));
        let current = locks.acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES).await.unwrap().unwrap();

        assert!(!locks.release_lock(&stale).await);

        let row = locks.inspect("weekly-aggregate", "2025-W03").await.unwrap().unwrap();
        assert_eq!(row.token, current.token);
        assert!(locks.acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_extends_only_live_owned_leases() {
        let clock = clock();
        let locks = manager(&clock);

        let lease = locks.acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(9 * 60));

        let renewed = locks.renew_lock(&lease, TEN_MINUTES).await.unwrap().unwrap();
        assert_eq!(renewed.expires_at, clock.now() + chrono::Duration::minutes(10));

        // Past the original expiry but inside the renewed one: still held.
        clock.advance(Duration::from_secs(5 * 60));
        assert!(locks.acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES).await.unwrap().is_none());

        clock.advance(Duration::from_secs(6 * 60));
        assert!(locks.renew_lock(&renewed, TEN_MINUTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let clock = clock();
        let locks = manager(&clock);

        assert!(matches!(
            locks.acquire_lock("", "k", TEN_MINUTES).await,
            Err(LockStoreError::Rejected(_))
        ));
        assert!(matches!(
            locks.acquire_lock("job", "k", Duration::ZERO).await,
            Err(LockStoreError::Rejected(_))
        ));
        assert!(locks.store().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_get_exactly_one_grant() {
        let locks = Arc::new(LockManager::new(InMemoryLockStore::new()));
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let locks = locks.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                locks
                    .acquire_lock("weekly-aggregate", "2025-W03", TEN_MINUTES)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn with_lock_runs_job_and_releases() {
        let clock = clock();
        let locks = manager(&clock);

        let outcome = locks
            .with_lock("weekly-aggregate", "2025-W03", TEN_MINUTES, |lease| async move {
                assert_eq!(lease.key(), "2025-W03");
                Ok::<_, String>(42)
            })
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Completed(42));
        assert!(locks.store().is_empty());
    }

    #[tokio::test]
    async fn with_lock_skips_when_held() {
        let clock = clock();
        let locks = manager(&clock);
        let ran = AtomicBool::new(false);

        let _held = locks.acquire_lock("notify", "berlin", TEN_MINUTES).await.unwrap().unwrap();
        let outcome = locks
            .with_lock("notify", "berlin", TEN_MINUTES, |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        assert!(outcome.is_skipped());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn with_lock_releases_and_returns_job_error() {
        let clock = clock();
        let locks = manager(&clock);

        let err = locks
            .with_lock("notify", "berlin", TEN_MINUTES, |_| async {
                Err::<(), _>("telegram down".to_string())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WithLockError::Job(ref msg) if msg == "telegram down"));
        assert!(locks.store().is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let store = FlakyStore::default();
        store.fail_acquire.store(true, Ordering::SeqCst);
        let locks = LockManager::with_clock(store, clock());
        let calls = AtomicUsize::new(0);

        let err = locks
            .with_lock("notify", "berlin", TEN_MINUTES, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WithLockError::Store(LockStoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn release_failure_is_swallowed() {
        let store = FlakyStore::default();
        store.fail_release.store(true, Ordering::SeqCst);
        let clock = clock();
        let locks = LockManager::with_clock(store, clock.clone());

        let outcome = locks
            .with_lock("notify", "berlin", TEN_MINUTES, |_| async { Ok::<_, String>("sent") })
            .await
            .unwrap();
        assert_eq!(outcome.completed(), Some("sent"));

        // The row lingers until its lease lapses.
        assert!(locks.acquire_lock("notify", "berlin", TEN_MINUTES).await.unwrap().is_none());
        clock.advance(TEN_MINUTES);
        assert!(locks.acquire_lock("notify", "berlin", TEN_MINUTES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn panicking_job_still_releases() {
        let locks = Arc::new(LockManager::new(InMemoryLockStore::new()));

        let task = tokio::spawn({
            let locks = locks.clone();
            async move {
                locks
                    .with_lock("ai-insights", "berlin", TEN_MINUTES, |_| async {
                        if true {
                            panic!("model returned garbage");
                        }
                        Ok::<(), String>(())
                    })
                    .await
            }
        });
        assert!(task.await.unwrap_err().is_panic());

        for _ in 0..10 {
            if locks.store().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(locks.store().is_empty());
    }

    #[tokio::test]
    async fn dropped_job_future_releases() {
        let locks = LockManager::new(InMemoryLockStore::new());

        let run = locks.with_lock("ai-insights", "berlin", TEN_MINUTES, |_| async {
            std::future::pending::<()>().await;
            Ok::<(), String>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), run).await;
        assert!(timed_out.is_err());

        for _ in 0..10 {
            if locks.store().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(locks.store().is_empty());
    }
}
