//! Interface to the message broker client

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::codec::Deserializer;
use crate::message::Delivered;

/// Connection to a broker that hands out one blocking stream per topic
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Stream: MessageStream + 'static;

    /// Open `count` streams for each topic, decoding values with `deserializer`
    async fn create_streams(
        &self,
        topic_counts: &HashMap<String, usize>,
        deserializer: Arc<dyn Deserializer>,
    ) -> Result<HashMap<String, Vec<Self::Stream>>>;

    /// Commit the offsets of everything consumed so far
    async fn commit_offsets(&self) -> Result<()>;

    /// Release the broker connection
    async fn shutdown(&self) -> Result<()>;
}

/// An ordered, blocking-iterable sequence of messages for one topic
#[async_trait]
pub trait MessageStream: Send {
    /// Wait until another message is available.
    ///
    /// Returns `Ok(false)` when the stream has ended.
    async fn has_next(&mut self) -> Result<bool>;

    /// Take the message announced by `has_next`
    async fn next_message(&mut self) -> Result<Delivered>;
}
