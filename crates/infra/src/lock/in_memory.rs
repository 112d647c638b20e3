use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobguard_core::{LeaseToken, LockId, LockRecord};

use super::store::{LockStore, LockStoreError};

/// In-memory lock table.
///
/// Intended for tests/dev and single-process deployments. The write lock is
/// held across the whole check-and-set, which makes acquisition atomic.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    rows: RwLock<HashMap<LockId, LockRecord>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored (live or expired).
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> LockStoreError {
    LockStoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        let epoch = match rows.get(id) {
            Some(existing) if existing.is_live_at(now) => return Ok(None),
            Some(existing) => existing.epoch + 1,
            None => 1,
        };

        let record = LockRecord {
            id: id.clone(),
            token,
            epoch,
            started_at: now,
            expires_at,
        };
        rows.insert(id.clone(), record.clone());
        Ok(Some(record))
    }

    async fn release(&self, id: &LockId, token: LeaseToken) -> Result<bool, LockStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        match rows.get(id) {
            Some(existing) if existing.token == token => {
                rows.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        match rows.get_mut(id) {
            Some(existing) if existing.token == token && existing.is_live_at(now) => {
                existing.expires_at = expires_at;
                Ok(Some(existing.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(id).cloned())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LockStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let before = rows.len();
        rows.retain(|_, record| !record.is_stale_at(now));
        Ok((before - rows.len()) as u64)
    }
}
