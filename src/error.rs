//! Error types for the staged consumer

use thiserror::Error;

use crate::consumer::LifecycleState;

/// Main error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown deserializer: {0}")]
    UnknownDeserializer(String),

    #[error("No handler registered for topic {0}")]
    UnknownTopic(String),

    #[error("Invalid lifecycle transition: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Worker pool {0} is shut down")]
    PoolShutdown(String),

    #[error("Worker pool {0} is saturated")]
    PoolSaturated(String),

    #[error("Overflow runner is shut down")]
    OverflowClosed,

    #[error("Error reprocessor is closed")]
    ReprocessorClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error returned by message handlers
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::HardFailure(err.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, ProcessingError::SoftFailure(_))
    }
}
