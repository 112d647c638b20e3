//! Lock row persistence boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use jobguard_core::{CoreError, LeaseToken, LockId, LockRecord};

/// Lock store operation error.
///
/// These are **infrastructure errors**. Contention is never an error: a
/// refused acquisition is `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum LockStoreError {
    /// The store could not be reached or failed mid-operation.
    #[error("lock store unavailable: {0}")]
    Unavailable(String),

    /// The store (or validation in front of it) refused the request.
    #[error("lock request rejected: {0}")]
    Rejected(String),

    /// A stored row could not be decoded.
    #[error("corrupt lock record: {0}")]
    Corrupt(String),
}

impl From<CoreError> for LockStoreError {
    fn from(err: CoreError) -> Self {
        Self::Rejected(err.to_string())
    }
}

/// Durable, shared storage for lock rows keyed by `(job_name, key)`.
///
/// ## Implementation Requirements
///
/// - `try_acquire` must be one indivisible compare-and-set: insert when no
///   row exists, or overwrite when the existing row's `expires_at <= now`.
///   Two concurrent callers must never both be granted a live lease.
/// - Every grant stores the caller's fresh `token` and bumps `epoch`
///   (1 for a new row).
/// - `release` and `renew` only touch the row when the token matches.
/// - `now` always comes from the caller; stores never consult their own clock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Grant the lease or report contention (`Ok(None)`).
    async fn try_acquire(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError>;

    /// Delete the row if it still carries `token`. Returns whether a row was removed.
    async fn release(&self, id: &LockId, token: LeaseToken) -> Result<bool, LockStoreError>;

    /// Move `expires_at` forward if the row still carries `token` and is live at `now`.
    async fn renew(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError>;

    /// Current row, expired or not.
    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError>;

    /// Delete every row with `expires_at < now`; returns the number removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LockStoreError>;
}

#[async_trait]
impl<S> LockStore for Arc<S>
where
    S: LockStore + ?Sized,
{
    async fn try_acquire(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        (**self).try_acquire(id, token, now, expires_at).await
    }

    async fn release(&self, id: &LockId, token: LeaseToken) -> Result<bool, LockStoreError> {
        (**self).release(id, token).await
    }

    async fn renew(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        (**self).renew(id, token, now, expires_at).await
    }

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
        (**self).get(id).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LockStoreError> {
        (**self).delete_expired(now).await
    }
}
