//! Lock identity, persisted lock rows, and granted leases.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::LeaseToken;
use crate::week::IsoWeek;

/// Natural key of a lock: the job type plus the partition it runs for.
///
/// e.g. `("weekly-aggregate", "2025-W03")` or `("ai-insights", "berlin")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId {
    job_name: String,
    key: String,
}

impl LockId {
    /// Both parts must be non-blank.
    pub fn new(job_name: impl Into<String>, key: impl Into<String>) -> CoreResult<Self> {
        let job_name = job_name.into();
        let key = key.into();

        if job_name.trim().is_empty() {
            return Err(CoreError::validation("job name must not be empty"));
        }
        if key.trim().is_empty() {
            return Err(CoreError::validation("lock key must not be empty"));
        }

        Ok(Self { job_name, key })
    }

    /// Lock for one ISO-week partition of a weekly job, keyed `YYYY-Www`.
    pub fn weekly(job_name: impl Into<String>, week: IsoWeek) -> CoreResult<Self> {
        Self::new(job_name, week.to_string())
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl core::fmt::Display for LockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.job_name, self.key)
    }
}

/// Compute the expiry of a lease granted at `now`.
///
/// Zero-length leases and durations that overflow the calendar are rejected.
pub fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> CoreResult<DateTime<Utc>> {
    if lease.is_zero() {
        return Err(CoreError::validation("lease duration must be positive"));
    }

    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| CoreError::validation(format!("lease duration {lease:?} is out of range")))
}

/// One row of the lock table: the current or most recent lease for a `LockId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: LockId,
    pub token: LeaseToken,
    /// Grant counter for this `LockId`; starts at 1 and increases on every
    /// re-acquisition of the row.
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// A lease is live strictly before its expiry instant.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Cleanup only removes rows whose expiry is strictly in the past.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Time left on the lease, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Proof of a successful acquisition.
///
/// Hand it back to release or renew; the token inside is what makes those
/// operations safe against reclaimed leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LockId,
    pub token: LeaseToken,
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn job_name(&self) -> &str {
        self.id.job_name()
    }

    pub fn key(&self) -> &str {
        self.id.key()
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl From<LockRecord> for Lease {
    fn from(record: LockRecord) -> Self {
        Self {
            id: record.id,
            token: record.token,
            epoch: record.epoch,
            started_at: record.started_at,
            expires_at: record.expires_at,
        }
    }
}
