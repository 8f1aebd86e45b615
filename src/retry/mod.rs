//! Retry and backoff used by the error reprocessor

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use error::RetryError;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (None for infinite)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff built from this config
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_backoff, self.max_backoff).with_jitter(self.jitter_factor)
    }
}

/// Resolves once shutdown is signalled or the signalling side is gone
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation until it succeeds, attempts run out or shutdown
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_while(operation, |_| true, shutdown).await
    }

    /// Like `retry`, but gives up at once when `is_retriable` says no
    pub async fn retry_while<F, Fut, T, E, P>(
        &mut self,
        mut operation: F,
        mut is_retriable: P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: FnMut(&E) -> bool,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let result = select! {
                result = operation() => result,
                _ = shutdown_signalled(shutdown) => {
                    debug!(attempts = self.attempts, "Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            };

            let e = match result {
                Ok(value) => {
                    debug!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retriable(&e) {
                warn!(attempts = self.attempts, error = %e, "Operation failed permanently");
                return Err(RetryError::NotRetriable(self.attempts, e.to_string()));
            }

            if let Some(max) = self.config.max_retries {
                if self.attempts >= max {
                    warn!(
                        attempts = self.attempts,
                        error = %e,
                        "Maximum retry attempts exceeded"
                    );
                    return Err(RetryError::MaxRetriesExceeded(self.attempts, e.to_string()));
                }
            }

            let delay = self.backoff.next_delay(self.attempts);
            warn!(
                attempt = self.attempts,
                delay_ms = ?delay.as_millis(),
                error = %e,
                "Operation failed, retrying after delay"
            );

            select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = shutdown_signalled(shutdown) => {
                    debug!("Retry interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
