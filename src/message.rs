//! The uniform message envelope passed between pipeline stages

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// An immutable message received from a topic stream
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    topic: String,
    key: Option<String>,
    offset: Option<i64>,
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            offset: None,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build the envelope for an item pulled from `topic`'s stream.
    ///
    /// Items that already carry an envelope pass through untouched.
    pub fn from_delivered(topic: &str, delivered: Delivered) -> Self {
        match delivered {
            Delivered::Envelope(message) => message,
            Delivered::Raw {
                key,
                offset,
                payload,
            } => Self {
                topic: topic.to_string(),
                key,
                offset,
                payload,
                received_at: Utc::now(),
            },
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// A deserialized item as produced by a topic stream
#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    /// Already a complete envelope
    Envelope(Message),
    /// A bare payload that still needs wrapping
    Raw {
        key: Option<String>,
        offset: Option<i64>,
        payload: Bytes,
    },
}

impl Delivered {
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Delivered::Raw {
            key: None,
            offset: None,
            payload: payload.into(),
        }
    }
}
