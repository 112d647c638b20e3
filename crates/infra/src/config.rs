//! Configuration loading from the process environment.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::lock::{DEFAULT_LEASE, LockManager, LockStore};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_DEFAULT_LEASE_SECS: &str = "JOBGUARD_DEFAULT_LEASE_SECS";
pub const ENV_DB_MAX_CONNECTIONS: &str = "JOBGUARD_DB_MAX_CONNECTIONS";

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings shared by lock-store consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGuardConfig {
    /// Postgres connection string; `None` means in-memory only.
    pub database_url: Option<String>,
    pub default_lease: Duration,
    pub db_max_connections: u32,
}

impl Default for JobGuardConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_lease: DEFAULT_LEASE,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

impl JobGuardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests, layered config).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty());

        let default_lease = match lookup(ENV_DEFAULT_LEASE_SECS) {
            Some(raw) => {
                let secs = parse_positive(ENV_DEFAULT_LEASE_SECS, &raw)?;
                Duration::from_secs(secs)
            }
            None => defaults.default_lease,
        };

        let db_max_connections = match lookup(ENV_DB_MAX_CONNECTIONS) {
            Some(raw) => {
                let n = parse_positive(ENV_DB_MAX_CONNECTIONS, &raw)?;
                u32::try_from(n).map_err(|_| ConfigError::Invalid {
                    var: ENV_DB_MAX_CONNECTIONS,
                    value: raw.clone(),
                    reason: "too large".to_string(),
                })?
            }
            None => defaults.db_max_connections,
        };

        Ok(Self {
            database_url,
            default_lease,
            db_max_connections,
        })
    }

    /// A manager over `store` whose `with_default_lease` grants
    /// `default_lease`.
    pub fn lock_manager<S>(&self, store: S) -> LockManager<S>
    where
        S: LockStore + 'static,
    {
        LockManager::new(store).default_lease_of(self.default_lease)
    }

    /// The database URL, or an error naming the variable to set.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        match self.database_url.as_deref() {
            Some(url) => Ok(url),
            None => {
                warn!("{ENV_DATABASE_URL} not set; a Postgres lock store cannot be used");
                Err(ConfigError::Missing(ENV_DATABASE_URL))
            }
        }
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(&e.to_string()))?;
    if value == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(value)
}
