//! Infrastructure layer: lock stores, the lock manager, resilient calls, config.

pub mod config;
pub mod lock;
pub mod retry;

pub use config::{ConfigError, JobGuardConfig};
pub use lock::{
    DEFAULT_LEASE, InMemoryLockStore, LockManager, LockOutcome, LockStore, LockStoreError,
    PostgresLockStore, WithLockError,
};
pub use retry::{
    AttemptError, LoggingObserver, RetryEvent, RetryExecutor, RetryObserver, RetryPolicy,
    TimeoutError, with_retry, with_timeout,
};
