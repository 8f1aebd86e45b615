use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{FailedMessage, ReprocessOutcome};
use crate::error::ProcessingError;
use crate::handler::guarded;
use crate::retry::{Backoff, RetryConfig, RetryError, RetryHandle};

/// How the error reprocessor treats one failed message
#[async_trait]
pub trait ReprocessStrategy: Send + Sync {
    /// Work on `failed` until it is recovered or given up.
    ///
    /// Implementations must return promptly once `shutdown` flips to `true`.
    async fn reprocess(
        &self,
        failed: &FailedMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReprocessOutcome;
}

/// Re-run stage 2 with backoff until it succeeds or retries run out
///
/// A [`ProcessingError::HardFailure`] stops retrying at once.
#[derive(Debug, Clone)]
pub struct RetryStrategy<B: Backoff + Clone> {
    config: RetryConfig,
    backoff: B,
}

impl<B: Backoff + Clone> RetryStrategy<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self { config, backoff }
    }
}

impl RetryStrategy<crate::retry::ExponentialBackoff> {
    /// Exponential backoff as described by `config`
    pub fn from_config(config: RetryConfig) -> Self {
        let backoff = config.backoff();
        Self::new(config, backoff)
    }
}

#[async_trait]
impl<B: Backoff + Clone + 'static> ReprocessStrategy for RetryStrategy<B> {
    async fn reprocess(
        &self,
        failed: &FailedMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReprocessOutcome {
        let mut retry = RetryHandle::new(self.config.clone(), self.backoff.clone());
        debug!(
            topic = %failed.message.topic(),
            handler = %failed.handler.name(),
            "Retrying stage 2"
        );

        let result = retry
            .retry_while(
                || guarded(failed.handler.p2_process(&failed.message)),
                |e: &ProcessingError| e.is_retriable(),
                shutdown,
            )
            .await;

        match result {
            Ok(()) => ReprocessOutcome::Recovered {
                attempts: retry.attempts(),
            },
            Err(RetryError::MaxRetriesExceeded(attempts, error)) => ReprocessOutcome::Dropped {
                attempts,
                reason: format!("retries exhausted: {}", error),
            },
            Err(RetryError::NotRetriable(attempts, error)) => ReprocessOutcome::Dropped {
                attempts,
                reason: format!("permanent failure: {}", error),
            },
            Err(RetryError::Interrupted) => ReprocessOutcome::interrupted(retry.attempts()),
        }
    }
}

/// Gives up on every message without touching the handler
#[derive(Debug, Default, Clone)]
pub struct DropStrategy;

#[async_trait]
impl ReprocessStrategy for DropStrategy {
    async fn reprocess(
        &self,
        failed: &FailedMessage,
        _shutdown: &mut watch::Receiver<bool>,
    ) -> ReprocessOutcome {
        warn!(
            topic = %failed.message.topic(),
            handler = %failed.handler.name(),
            error = %failed.error,
            "Dropping failed message"
        );
        ReprocessOutcome::Dropped {
            attempts: 0,
            reason: failed.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageHandler;
    use crate::message::Message;
    use crate::retry::FixedBackoff;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Fails stage 2 a fixed number of times, softly or hard
    struct Flaky {
        failures: u32,
        hard: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn p1_process(&self, _message: &Message) -> Result<(), ProcessingError> {
            Ok(())
        }

        async fn p2_process(&self, _message: &Message) -> Result<(), ProcessingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                let e = anyhow::anyhow!("still failing");
                return Err(if self.hard {
                    ProcessingError::hard(e)
                } else {
                    ProcessingError::soft(e)
                });
            }
            Ok(())
        }

        async fn on_process_error(&self, _message: &Message, _error: &ProcessingError) -> bool {
            false
        }
    }

    fn failed(handler: Arc<Flaky>) -> FailedMessage {
        FailedMessage::new(Arc::new(Message::new("orders", "B")), handler, "first try")
    }

    fn strategy(max_retries: u32) -> RetryStrategy<FixedBackoff> {
        let config = RetryConfig {
            max_retries: Some(max_retries),
            ..Default::default()
        };
        RetryStrategy::new(config, FixedBackoff::new(Duration::from_millis(5)))
    }

    fn flaky(failures: u32, hard: bool) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            hard,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_retry_recovers_after_soft_failures() {
        let handler = flaky(2, false);
        let (_tx, mut rx) = watch::channel(false);

        let outcome = strategy(5).reprocess(&failed(handler.clone()), &mut rx).await;

        assert_eq!(outcome, ReprocessOutcome::Recovered { attempts: 3 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let handler = flaky(10, false);
        let (_tx, mut rx) = watch::channel(false);

        let outcome = strategy(3).reprocess(&failed(handler.clone()), &mut rx).await;

        assert!(matches!(outcome, ReprocessOutcome::Dropped { attempts: 3, .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_retried() {
        let handler = flaky(10, true);
        let (_tx, mut rx) = watch::channel(false);

        let outcome = strategy(5).reprocess(&failed(handler.clone()), &mut rx).await;

        match outcome {
            ReprocessOutcome::Dropped { attempts, reason } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("permanent"));
            }
            other => panic!("expected drop, got {:?}", other),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let handler = flaky(10, false);
        let config = RetryConfig {
            max_retries: None,
            ..Default::default()
        };
        let strategy = RetryStrategy::new(config, FixedBackoff::new(Duration::from_secs(60)));
        let (tx, mut rx) = watch::channel(false);

        let task = tokio::spawn(async move { strategy.reprocess(&failed(handler), &mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).ok();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reprocess did not observe shutdown")
            .expect("reprocess task panicked");
        assert!(outcome.is_interrupted());
    }

    #[tokio::test]
    async fn test_drop_strategy_never_calls_handler() {
        let handler = flaky(0, false);
        let (_tx, mut rx) = watch::channel(false);

        let outcome = DropStrategy.reprocess(&failed(handler.clone()), &mut rx).await;

        assert_eq!(
            outcome,
            ReprocessOutcome::Dropped {
                attempts: 0,
                reason: "first try".to_string()
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
