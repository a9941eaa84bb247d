//! Bounded retry with exponential backoff.
//!
//! Network operations report each failure as either transient (worth another
//! attempt) or permanent. [`RetryPolicy::run`] drives the loop and returns the
//! final success or the last error once the attempt budget is spent.

use crate::error::UpdateError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Default total attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
/// Default cap on any single delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 8_000;
/// Default growth factor between consecutive delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (caps exponential growth).
    pub max_delay_ms: u64,
    /// Backoff multiplier (2.0 for exponential backoff).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

/// Outcome of a single failed attempt.
#[derive(Debug, Clone)]
pub struct AttemptError {
    /// Error to report if this turns out to be the final attempt.
    pub error: UpdateError,
    /// Whether another attempt may succeed.
    pub transient: bool,
}

impl AttemptError {
    /// A failure worth retrying (connection reset, 5xx, timeout, truncation).
    pub fn transient(error: UpdateError) -> Self {
        Self {
            error,
            transient: true,
        }
    }

    /// A failure that will not go away by retrying (4xx, malformed data, disk full).
    pub fn permanent(error: UpdateError) -> Self {
        Self {
            error,
            transient: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay in milliseconds.
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set the maximum delay in milliseconds.
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate the delay before retry number `retry` (1-based).
    ///
    /// Formula: `min(base * multiplier^(retry-1) + jitter, max_delay)` where
    /// jitter is up to 10% of the un-jittered delay.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::from_millis(0);
        }

        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let exp = self.backoff_multiplier.max(1.0).powi(retry as i32 - 1);
        let delay = (base * exp).min(max);
        let jitter = delay * (rand::random::<f64>() * 0.1);

        Duration::from_millis((delay + jitter).min(max) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, UpdateError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) if !failure.transient => {
                    tracing::warn!(%label, attempt, error = %failure.error, "permanent failure, not retrying");
                    return Err(failure.error);
                }
                Err(failure) if attempt >= attempts => {
                    tracing::error!(%label, attempts, error = %failure.error, "retries exhausted");
                    return Err(failure.error);
                }
                Err(failure) => {
                    let delay = self.delay_for_retry(attempt);
                    tracing::warn!(
                        %label,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
