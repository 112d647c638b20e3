//! Retry policy: how many times, how long to wait, how long each attempt may take.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobguard_core::{CoreError, CoreResult};

/// Retry policy configuration.
///
/// Stateless value object: one policy can drive any number of concurrent calls.
/// Delay before attempt `n` (`n >= 1`, attempt 0 is the first call) is
/// `min(initial_delay * backoff_multiplier^(n-1), max_delay)`, then scaled
/// down by up to `jitter` (never up, so the cap holds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays (> 1)
    pub backoff_multiplier: f64,
    /// Budget for each individual attempt
    pub timeout: Duration,
    /// Fraction (0.0-1.0) of each delay that may be randomly shaved off
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, default timeout.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Doubling backoff with the given bounds.
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Long-latency generative model calls.
    pub fn generative_ai() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(60),
            jitter: 0.1,
        }
    }

    /// Short-latency webhook / messaging calls.
    pub fn webhook() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(10),
            jitter: 0.1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Total number of calls the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 1.0) {
            return Err(CoreError::validation(format!(
                "backoff multiplier must be > 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(CoreError::validation(format!(
                "initial delay {:?} exceeds max delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CoreError::validation(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if self.timeout.is_zero() {
            return Err(CoreError::validation("attempt timeout must be positive"));
        }
        Ok(())
    }

    /// Capped exponential delay before attempt `attempt`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let cap = self.max_delay.as_nanos() as f64;
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exp);

        if !raw.is_finite() || raw >= cap {
            self.max_delay
        } else {
            Duration::from_nanos(raw.max(0.0).round() as u64)
        }
    }

    /// Apply jitter to `base` using `sample` in `[0, 1)`.
    pub fn jittered(&self, base: Duration, sample: f64) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 - jitter * sample.clamp(0.0, 1.0);
        Duration::from_nanos((base.as_nanos() as f64 * factor).round() as u64)
    }

    /// Delay actually slept before attempt `attempt`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        self.jittered(base, rand::random::<f64>())
    }

    /// Whether another attempt may follow attempt `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
