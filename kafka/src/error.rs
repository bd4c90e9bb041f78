//! Error types for the Kafka library.

use thiserror::Error;

/// Result type alias for Kafka operations.
pub type Result<T> = std::result::Result<T, KafkaError>;

/// Errors that can occur during Kafka operations.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Error from the underlying rdkafka library while building a client.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Error serializing an event. Never retried.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error deserializing a consumed payload.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The publish path rejected the call without touching the transport.
    #[error("failed to publish to {topic}: circuit breaker '{breaker}' is open")]
    CircuitOpen { topic: String, breaker: String },

    /// Send or receive failure reported by the transport.
    #[error("failed to {operation} {topic}: {source}")]
    Transport {
        topic: String,
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    /// Failure to join or maintain consumer group membership.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Error from a message handler.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid producer or consumer configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error during consumer shutdown.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl KafkaError {
    /// True when the error is a fast-fail from an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Failure reported by a [`Transport`](crate::Transport) or
/// [`ConsumerGroup`](crate::ConsumerGroup) implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The transport is unreachable or refused the request.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
