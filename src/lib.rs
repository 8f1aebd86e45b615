//! Staged Consumer - a two-stage, backpressure-aware topic consumer
//!
//! Messages are pulled from per-topic streams by fetch workers, which run a
//! handler's first stage inline and hand the second stage to a bounded
//! worker pool. Fetching pauses while the pool has no free worker; tasks the
//! pool cannot take run on an overflow runner, and second-stage failures the
//! handler leaves unresolved go to an error reprocessor.

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod message;
pub mod monitoring;
pub mod pool;
pub mod reprocess;
pub mod retry;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;
#[cfg(test)]
mod tests;

pub use broker::{BrokerConnector, MessageStream};
pub use codec::{Deserializer, DeserializerRegistry};
pub use config::PipelineConfig;
pub use consumer::{ConsumerOptions, LifecycleState, TopicConsumer};
pub use error::{PipelineError, ProcessingError, Result};
pub use handler::MessageHandler;
pub use message::{Delivered, Message};
pub use pool::{BoundedWorkerPool, OverflowRunner, PoolConfig, SaturationPolicy};
pub use reprocess::{
    DeadLetterSink, DropStrategy, ErrorReprocessor, FailedMessage, ReprocessOutcome,
    ReprocessStrategy, RetryStrategy,
};
pub use retry::{Backoff, ExponentialBackoff, FixedBackoff};
