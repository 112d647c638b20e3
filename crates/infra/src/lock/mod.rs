//! Lease-based distributed mutex for background jobs.
//!
//! ## Components
//!
//! - `LockStore`: durable row storage with an atomic compare-and-set grant
//! - `InMemoryLockStore` / `PostgresLockStore`: the two backends
//! - `LockManager`: acquire / release / renew / `with_lock` / cleanup

pub mod in_memory;
pub mod manager;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryLockStore;
pub use manager::{DEFAULT_LEASE, LockManager, LockOutcome, WithLockError};
pub use postgres::PostgresLockStore;
pub use store::{LockStore, LockStoreError};
