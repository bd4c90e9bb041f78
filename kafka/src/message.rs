//! Wire envelope for published and consumed messages.

use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use uuid::Uuid;

use crate::error::{KafkaError, Result};

/// Header carrying the payload's media type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Header carrying the trace id of the publishing call.
pub const TRACE_ID_HEADER: &str = "trace-id";

/// Media type of every payload this library publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

tokio::task_local! {
    static CURRENT_TRACE: TraceId;
}

/// 128-bit trace identifier rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Generates a fresh random trace id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parses a 32 character hex trace id, e.g. one received in a header.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trace id of the message being handled on this task, if any.
    ///
    /// Set while a consumer handler runs. Tasks spawned by the handler do
    /// not inherit it.
    pub fn current() -> Option<Self> {
        CURRENT_TRACE.try_with(Clone::clone).ok()
    }

    /// Runs `future` with this id as the current trace.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT_TRACE.scope(self, future).await
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message ready to be handed to a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Builds a JSON message carrying the content-type and trace-id headers.
    pub fn json(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>, trace_id: &TraceId) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: vec![
                (CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string()),
                (TRACE_ID_HEADER.to_string(), trace_id.to_string()),
            ],
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Partition and offset the transport acknowledged for a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A message received from one partition of a consumer group claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl InboundMessage {
    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    /// Key as UTF-8, if present and valid.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|key| std::str::from_utf8(key).ok())
    }

    /// Trace id propagated by the publisher.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.header(TRACE_ID_HEADER)
            .and_then(|value| std::str::from_utf8(value).ok())
            .and_then(TraceId::parse)
    }

    /// Deserializes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`KafkaError::Deserialization`] if the payload is not valid JSON
    /// for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            KafkaError::Deserialization(format!(
                "{}/{}@{}: {}",
                self.topic, self.partition, self.offset, e
            ))
        })
    }
}

impl From<OutboundMessage> for InboundMessage {
    /// Converts a sent message into its consumed form; the coordinates are
    /// filled in by whoever stored it.
    fn from(message: OutboundMessage) -> Self {
        Self {
            topic: message.topic,
            partition: 0,
            offset: 0,
            key: Some(message.key.into_bytes()),
            payload: message.payload,
            headers: message
                .headers
                .into_iter()
                .map(|(key, value)| (key, value.into_bytes()))
                .collect(),
        }
    }
}
