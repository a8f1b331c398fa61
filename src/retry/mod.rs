//! Retry execution with exponential backoff and jitter
//!
//! Jitter is a random value up to 10% of the computed delay, so concurrent
//! callers retrying against the same provider do not synchronize.

pub mod breaker;

use crate::config::RetryConfig;
use crate::error::{ClassifiedError, GatewayError};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Cheap cloneable cancellation flag. Checked between retry attempts and
/// before each fan-out call; an in-flight network request is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Retry executor configured per provider
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> usize {
        self.config.max_attempts
    }

    /// Run `op` up to `max_attempts` times. Non-retryable errors and
    /// exhausted attempts surface the last classified error unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        provider: &str,
        cancel: Option<&CancelToken>,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        self.execute_with_hook(provider, cancel, op, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), invoking `on_retry(attempt, error)`
    /// before each backoff sleep.
    pub async fn execute_with_hook<T, F, Fut, H>(
        &self,
        provider: &str,
        cancel: Option<&CancelToken>,
        mut op: F,
        mut on_retry: H,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
        H: FnMut(usize, &ClassifiedError),
    {
        let mut attempt = 0;
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(GatewayError::Cancelled);
                }
            }

            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.retryable || attempt >= self.config.max_attempts {
                        return Err(GatewayError::Provider(err));
                    }

                    let delay = self.backoff_delay(attempt, err.retry_after);
                    warn!(
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed: {}, retrying",
                        err
                    );
                    on_retry(attempt, &err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before attempt `attempt + 1`. A provider-supplied retry hint
    /// wins over the computed exponential backoff.
    fn backoff_delay(&self, attempt: usize, provided: Option<Duration>) -> Duration {
        if let Some(hint) = provided {
            return hint.min(self.config.max_delay());
        }

        let exp = self.config.backoff_multiplier.powi(attempt as i32 - 1);
        let base_ms = self.config.base_delay_ms as f64 * exp;
        let capped_ms = base_ms.min(self.config.max_delay_ms as f64);

        let jitter_ms = if capped_ms >= 10.0 {
            rand::thread_rng().gen_range(0.0..capped_ms / 10.0)
        } else {
            0.0
        };

        Duration::from_millis((capped_ms + jitter_ms) as u64).min(self.config.max_delay())
    }
}
