//! Exponential backoff for transient store and dispatch failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{BatchError, BatchResult};

/// Retry policy
///
/// Retries stop on success, on a non-retryable error, once `max_attempts`
/// attempts have been made (0 = unbounded), or when the token is cancelled.
#[derive(Debug, Clone)]
pub struct Retry {
    pub initial_delay: Duration,
    pub maximum_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
}

impl From<&RetryConfig> for Retry {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            maximum_delay: Duration::from_millis(config.maximum_delay_ms),
            factor: config.factor,
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl Retry {
    /// Copy of this policy with a different attempt ceiling
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.maximum_delay.as_secs_f64()))
    }

    /// Run `op` until it succeeds or the policy gives up, returning the last error.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> BatchResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BatchResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            let delay = self.delay(attempt);
            attempt += 1;
            if self.max_attempts > 0 && attempt >= self.max_attempts {
                return Err(err);
            }
            warn!(attempt, ?delay, error = %err, "{what} failed, retrying");

            tokio::select! {
                _ = cancel.cancelled() => return Err(BatchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
