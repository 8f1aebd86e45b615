//! Value deserializers and the registry that resolves them by name

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::message::Delivered;

/// Property naming the value deserializer
pub const VALUE_DESERIALIZER: &str = "value.deserializer";

/// Identifier used when no deserializer is configured
pub const DEFAULT_DESERIALIZER: &str = "bytes";

/// Turns raw stream bytes into a delivered item
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, topic: &str, payload: &[u8]) -> anyhow::Result<Delivered>;
}

/// Passes bytes through untouched
#[derive(Debug, Default, Clone)]
pub struct BytesDeserializer;

impl Deserializer for BytesDeserializer {
    fn deserialize(&self, _topic: &str, payload: &[u8]) -> anyhow::Result<Delivered> {
        Ok(Delivered::raw(Bytes::copy_from_slice(payload)))
    }
}

/// Accepts only UTF-8 payloads
#[derive(Debug, Default, Clone)]
pub struct StringDeserializer;

impl Deserializer for StringDeserializer {
    fn deserialize(&self, topic: &str, payload: &[u8]) -> anyhow::Result<Delivered> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| anyhow::anyhow!("invalid UTF-8 payload on topic {}: {}", topic, e))?;
        Ok(Delivered::raw(Bytes::copy_from_slice(text.as_bytes())))
    }
}

/// Maps configuration identifiers to deserializer instances
#[derive(Clone, Default)]
pub struct DeserializerRegistry {
    entries: HashMap<String, Arc<dyn Deserializer>>,
}

impl DeserializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `bytes` and `string` deserializers
    pub fn with_defaults() -> Self {
        Self::new()
            .register("bytes", BytesDeserializer)
            .register("string", StringDeserializer)
    }

    pub fn register(mut self, id: impl Into<String>, deserializer: impl Deserializer + 'static) -> Self {
        self.entries.insert(id.into(), Arc::new(deserializer));
        self
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Deserializer>> {
        match self.entries.get(id) {
            Some(deserializer) => {
                debug!(deserializer = %id, "Resolved value deserializer");
                Ok(deserializer.clone())
            }
            None => Err(PipelineError::UnknownDeserializer(id.to_string())),
        }
    }

    /// Resolve the deserializer named by `value.deserializer`, defaulting to bytes
    pub fn resolve_from_properties(
        &self,
        properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn Deserializer>> {
        let id = properties
            .get(VALUE_DESERIALIZER)
            .map(String::as_str)
            .unwrap_or(DEFAULT_DESERIALIZER);
        self.resolve(id)
    }
}
