//! Lease fencing token.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Fencing token issued with every lease grant.
///
/// A release or renewal only takes effect when the caller presents the token
/// currently stored for the lock, so a holder whose lease expired and was
/// reclaimed cannot disturb the new holder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Fresh random token (UUIDv7).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for LeaseToken {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<LeaseToken> for Uuid {
    fn from(value: LeaseToken) -> Self {
        value.0
    }
}

impl FromStr for LeaseToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| CoreError::invalid_id(format!("LeaseToken: {e}")))
    }
}
