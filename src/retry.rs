//! Explicit retry policy with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value injected into the messaging layer and
//! [`RetryingStore`](crate::store::RetryingStore). The worker pool probes at
//! a fixed interval from [`PoolSettings`](crate::config::PoolSettings)
//! instead. Delays follow `base * multiplier^attempt`, spread by `±jitter` (a
//! fraction of the computed delay).

use std::future::Future;
use std::time::Duration;

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Backoff parameters.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sheetrelay::retry::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_attempts: 4,
///     base_delay_ms: 500,
///     multiplier: 2.0,
///     jitter: 0.0,
/// };
/// assert_eq!(policy.delay_for(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fractional jitter in `[0, 1)`; `0.25` means ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Upper bound on a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(300);

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// A fixed-interval policy (no growth, no jitter).
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        if !millis.is_finite() || millis >= MAX_DELAY.as_millis() as f64 {
            return MAX_DELAY;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Delay for `attempt` with jitter applied.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 0.99);
        let range = (base.as_millis() as f64 * jitter) as i64;
        if range <= 0 {
            return base;
        }
        let offset = rand::rng().random_range(-range..=range);
        Duration::from_millis((base.as_millis() as i64 + offset).max(0) as u64)
    }

    /// Returns `true` if another attempt is allowed after `attempt` (0-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts.max(1)
    }

    /// Runs `op` until it succeeds, `retryable` rejects its error, attempts
    /// run out, or `cancel` fires during a backoff sleep.
    ///
    /// Returns the last error when giving up.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        mut retryable: impl FnMut(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !retryable(&err) || !self.should_retry(attempt) {
                        return Err(err);
                    }
                    let delay = self.jittered_delay_for(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Sleeps for `delay`. Returns `false` if `cancel` fired first.
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = token.cancelled() => false,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
