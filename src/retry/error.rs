use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Maximum retries ({0}) exceeded: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Non-retriable failure after {0} attempts: {1}")]
    NotRetriable(u32, String),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}
