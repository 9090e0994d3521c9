//! Retry with exponential backoff.
//!
//! This is the only place that reacts to HTTP 429: the client reports it as
//! an error carrying the server's `retry-after`, and the handler waits for
//! the longer of that value and its own backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::Retryable;
use crate::model::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryHandler {
    max_attempts: u32,
    delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryHandler {
    pub fn new(max_attempts: u32, delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff_multiplier: if backoff_multiplier.is_finite() && backoff_multiplier > 0.0 {
                backoff_multiplier
            } else {
                1.0
            },
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.delay_ms),
            config.backoff_multiplier,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based):
    /// `delay × multiplier^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        self.delay.mul_f64(factor)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    let backoff = self.backoff(attempt);
                    let wait = err.retry_after().map_or(backoff, |ra| ra.max(backoff));
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
