//! Retry utilities for storage calls that fail transiently.

use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if scaled.is_finite() && scaled < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_backoff
        }
    }

    fn with_jitter(&self, backoff: Duration) -> Duration {
        if !self.jitter {
            return backoff;
        }
        // Up to a tenth on top.
        backoff.mul_f64(1.0 + rand::random::<f64>() * 0.1)
    }
}

/// Execute an operation, retrying recoverable errors with exponential backoff
pub async fn retry_with_config<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if !error.is_recoverable() || attempt >= config.max_attempts {
            if attempt > 1 {
                tracing::error!(attempts = attempt, category = error.category(), "Giving up: {}", error);
            }
            return Err(error);
        }

        let delay = config.with_jitter(config.backoff(attempt));
        tracing::warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Attempt failed, retrying: {}",
            error
        );
        sleep(delay).await;
        attempt += 1;
    }
}
