//! Resilient calls to external services: per-attempt timeouts plus
//! capped exponential backoff.

pub mod executor;
pub mod policy;

pub use executor::{
    AttemptError, LoggingObserver, RetryEvent, RetryExecutor, RetryObserver, TimeoutError,
    with_retry, with_timeout,
};
pub use policy::RetryPolicy;
