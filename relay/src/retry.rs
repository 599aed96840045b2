//! Retry policy - exponential backoff with jitter for remote ledger calls
//!
//! Every attempt runs under the per-call timeout. Only errors that
//! [`Error::is_retryable`] are retried; anything else returns at once.

use crate::config::RetryConfig;
use crate::{Error, Result};
use bridge_core::Metrics;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry policy for remote calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create policy from config
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Per-call deadline
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    /// Delay before retry number `retry` (0 = before the second attempt)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay =
            self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(retry as i32);

        // Cap at max delay
        let capped_delay = base_delay.min(self.config.max_backoff_ms as f64);

        // Spread retries of concurrent groups
        let jitter_range = capped_delay * self.config.jitter;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run a single call under the per-call timeout
    pub async fn timed<Fut, T>(&self, operation_name: &str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {:?}",
                operation_name,
                self.call_timeout()
            ))),
        }
    }

    /// Execute `operation` with retry
    ///
    /// The closure receives the attempt index (0-based) so a retried
    /// state-changing call can check whether an earlier attempt landed.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        metrics: &Metrics,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.calculate_delay(attempt - 1);
                metrics.record_retry();
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying remote call"
                );
                tokio::time::sleep(delay).await;
            }

            match self.timed(operation_name, operation(attempt)).await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "Remote call succeeded on retry"
                        );
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Remote call failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Unavailable(format!("{}: retry budget exhausted", operation_name))
        }))
    }
}
