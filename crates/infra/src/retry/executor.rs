//! Timeout racing and retry-with-backoff for calls to unreliable services.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use jobguard_core::CoreError;

use super::policy::RetryPolicy;

/// The attempt did not finish within its time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {after:?}")]
pub struct TimeoutError {
    pub after: Duration,
}

/// Why a call failed: slowness, the operation's own error, or a policy that
/// was refused before any attempt ran.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    #[error(transparent)]
    TimedOut(#[from] TimeoutError),

    #[error("{0}")]
    Failed(E),

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[source] CoreError),
}

impl<E> AttemptError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::TimedOut(_))
    }

    /// The operation's own error, if it was not a timeout.
    pub fn into_failure(self) -> Option<E> {
        match self {
            AttemptError::Failed(err) => Some(err),
            AttemptError::TimedOut(_) | AttemptError::InvalidPolicy(_) => None,
        }
    }
}

/// Race `operation` against a timer.
///
/// On timeout the operation's future is dropped, which stops it at its next
/// suspension point. Work it already handed off elsewhere (spawned tasks,
/// requests in flight at a remote service) is not recalled.
pub async fn with_timeout<F>(operation: F, timeout: Duration) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| TimeoutError { after: timeout })
}

/// Notification that an attempt failed and another one is scheduled.
pub struct RetryEvent<'a> {
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    pub max_retries: u32,
    /// Sleep before the next attempt
    pub delay: Duration,
    pub timed_out: bool,
    pub error: &'a dyn fmt::Display,
}

/// Observer for retries. Purely informational: it has no way to influence
/// whether or when the next attempt happens.
pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, event: &RetryEvent<'_>);
}

impl<F> RetryObserver for F
where
    F: Fn(&RetryEvent<'_>) + Send + Sync,
{
    fn on_retry(&self, event: &RetryEvent<'_>) {
        self(event)
    }
}

/// Emits one `warn` line per retry, tagged with the called service.
#[derive(Debug, Clone)]
pub struct LoggingObserver {
    service: String,
}

impl LoggingObserver {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl RetryObserver for LoggingObserver {
    fn on_retry(&self, event: &RetryEvent<'_>) {
        warn!(
            service = %self.service,
            attempt = event.attempt,
            timed_out = event.timed_out,
            error = %event.error,
            "{} retry",
            self.service
        );
    }
}

/// Runs operations under a `RetryPolicy`, with an optional observer.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl RetryObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Generative-model calls: long timeout, logged retries.
    pub fn generative_ai() -> Self {
        Self::new(RetryPolicy::generative_ai()).with_observer(LoggingObserver::new("generative-ai"))
    }

    /// Webhook / messaging calls: short timeout, logged retries.
    pub fn webhook() -> Self {
        Self::new(RetryPolicy::webhook()).with_observer(LoggingObserver::new("webhook"))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `operation` until it succeeds or the policy is exhausted.
    ///
    /// Each attempt is bounded by `policy.timeout`. After exhaustion the last
    /// attempt's error is returned unchanged (a timeout stays a timeout).
    /// A policy that fails `RetryPolicy::validate` is refused before the
    /// first call.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, AttemptError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let policy = &self.policy;
        if let Err(err) = policy.validate() {
            error!(error = %err, "refusing to run with invalid retry policy");
            return Err(AttemptError::InvalidPolicy(err));
        }
        let mut attempt: u32 = 0;

        loop {
            let err = match with_timeout(operation(), policy.timeout).await {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => AttemptError::Failed(err),
                Err(timeout) => AttemptError::TimedOut(timeout),
            };

            if !policy.should_retry(attempt) {
                error!(
                    max_retries = policy.max_retries,
                    error = %err,
                    "all retry attempts failed"
                );
                return Err(err);
            }

            attempt += 1;
            let delay = policy.delay_before_attempt(attempt);

            warn!(
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry attempt"
            );

            if let Some(observer) = &self.observer {
                observer.on_retry(&RetryEvent {
                    attempt,
                    max_retries: policy.max_retries,
                    delay,
                    timed_out: err.is_timeout(),
                    error: &err,
                });
            }

            tokio::time::sleep(delay).await;
        }
    }
}

/// `RetryExecutor::new(policy.clone()).run(operation)`.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, AttemptError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    RetryExecutor::new(policy.clone()).run(operation).await
}
