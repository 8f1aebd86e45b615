//! The two-phase handler contract

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::ProcessingError;
use crate::message::Message;

/// Trait for implementing topic processing logic
///
/// A handler is bound to one topic and shared by every stream of that topic.
/// `p1_process` is only ever called from the topic's fetch task, so it runs
/// in stream order. `p2_process` and `on_process_error` run on pool workers
/// and may be invoked concurrently.
///
/// # Examples
///
/// ```rust
/// use staged_consumer::{Message, MessageHandler, ProcessingError};
///
/// struct Orders;
///
/// #[async_trait::async_trait]
/// impl MessageHandler for Orders {
///     async fn p1_process(&self, message: &Message) -> Result<(), ProcessingError> {
///         // Cheap validation on the fetch task
///         message
///             .payload_str()
///             .map(|_| ())
///             .ok_or_else(|| ProcessingError::hard(anyhow::anyhow!("not utf-8")))
///     }
///
///     async fn p2_process(&self, _message: &Message) -> Result<(), ProcessingError> {
///         Ok(())
///     }
///
///     async fn on_process_error(&self, _message: &Message, _error: &ProcessingError) -> bool {
///         // Hand everything to the error reprocessor
///         false
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// First stage, run inline on the fetch task
    async fn p1_process(&self, message: &Message) -> Result<(), ProcessingError>;

    /// Second stage, run on a process pool worker
    async fn p2_process(&self, message: &Message) -> Result<(), ProcessingError>;

    /// Called after `p2_process` fails.
    ///
    /// Returns `true` when the handler resolved the failure itself, `false`
    /// to forward the message to the error reprocessor.
    async fn on_process_error(&self, message: &Message, error: &ProcessingError) -> bool;

    /// Identity used in logs
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Await a handler future, turning a panic into a hard failure
pub(crate) async fn guarded<F>(fut: F) -> Result<(), ProcessingError>
where
    F: std::future::Future<Output = Result<(), ProcessingError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ProcessingError::hard(anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(&panic)
        ))),
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn p1_process(&self, _message: &Message) -> Result<(), ProcessingError> {
            Ok(())
        }

        async fn p2_process(&self, _message: &Message) -> Result<(), ProcessingError> {
            panic!("exploded in stage two");
        }

        async fn on_process_error(&self, _message: &Message, _error: &ProcessingError) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_guarded_converts_panic() {
        let message = Message::new("t", "x");
        let result = guarded(Noop.p2_process(&message)).await;

        match result {
            Err(ProcessingError::HardFailure(e)) => {
                assert!(e.to_string().contains("exploded in stage two"));
            }
            other => panic!("expected hard failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_guarded_passes_result() {
        let message = Message::new("t", "x");
        assert!(guarded(Noop.p1_process(&message)).await.is_ok());
    }

    #[test]
    fn test_default_name_is_type_name() {
        assert!(Noop.name().ends_with("Noop"));
    }
}
