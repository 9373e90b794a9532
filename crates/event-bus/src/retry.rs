//! Capped exponential backoff shared by subscriptions, handlers and queues.

use std::time::Duration;

/// How often and how patiently a failed delivery is retried.
///
/// Retry `n` (1-based) waits `retry_delay * backoff_multiplier^(n-1)`,
/// capped at `max_retry_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_retries` and default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that gives up after the first failure.
    pub fn no_retries() -> Self {
        Self::new(0)
    }

    /// Sets the delay before the first retry.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the factor applied to the delay per retry.
    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Caps the delay between retries.
    pub fn with_max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    /// Delay before retry number `retry`, counting from 1.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.max(0.0);
        let cap = self.max_retry_delay.as_secs_f64();
        let secs = (self.retry_delay.as_secs_f64() * multiplier.powi(exponent)).min(cap);

        Duration::try_from_secs_f64(secs).unwrap_or(self.max_retry_delay)
    }

    /// Whether retry number `retry` (1-based) is still within budget.
    pub fn allows_retry(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Returns the initial attempt plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
