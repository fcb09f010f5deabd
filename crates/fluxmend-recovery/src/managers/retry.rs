//! Exponential backoff for transient control-plane failures

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::Result;

/// Retry policy for control-plane calls
///
/// Only transient errors (see [`OrchestrationError::is_transient`]) are
/// retried; anything else is returned after the first attempt.
///
/// [`OrchestrationError::is_transient`]: crate::error::OrchestrationError::is_transient
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_backoff_ms as f64) as u64)
    }

    /// Runs `call` until it succeeds, fails permanently or the budget is spent
    ///
    /// Returns the final result together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return (Ok(value), attempts),
                Err(err) if err.is_transient() && attempts <= self.max_retries => {
                    let delay = self.calculate_delay(attempts);
                    debug!(
                        call = label,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(call = label, attempts, error = %err, "Retry budget exhausted");
                    }
                    return (Err(err), attempts);
                }
            }
        }
    }
}
