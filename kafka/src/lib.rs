//! Resilient Kafka producer and consumer-group library for banking events.
//!
//! This crate provides event publishing and consumption built on top of
//! `rdkafka` and `tokio`.
//!
//! # Features
//!
//! - [`Producer`] publishing JSON events keyed by [`Event::key`], guarded by a
//!   [`CircuitBreaker`] that fails fast while the cluster is unhealthy
//! - [`Consumer`] running one ordered task per claimed partition, committing
//!   only what its handler processed successfully
//! - `topic_handlers!` macro for topic-based handler registration
//! - Trace id propagation through the `trace-id` header and tracing spans
//! - Graceful shutdown that waits for in-flight handlers
//! - [`MemoryBroker`] for tests without a running cluster
//!
//! # Example Producer
//!
//! ```no_run
//! use banking_events::{BaseEvent, EventType, TopicConfig, UserCreated};
//! use banking_kafka::{Producer, ProducerConfig};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let producer = Producer::new(ProducerConfig::new(["localhost:9092"], "user-service"))?;
//!     let topics = TopicConfig::default();
//!
//!     let event = UserCreated {
//!         base: BaseEvent::new(EventType::UserCreated, "user-service"),
//!         user_id: Uuid::new_v4(),
//!         email: "jane@example.com".to_string(),
//!         first_name: "Jane".to_string(),
//!         last_name: "Doe".to_string(),
//!         tier: "standard".to_string(),
//!     };
//!     producer.publish_event(&topics, &event).await?;
//!     Ok(())
//! }
//! ```

mod breaker;
mod config;
mod consumer;
mod error;
mod memory;
mod message;
mod producer;

pub use breaker::{
    BreakerError, BreakerSettings, CircuitBreaker, CircuitState, Counts, LogObserver, StateObserver,
};
pub use config::{Compression, ConsumerConfig, OffsetReset, ProducerConfig, RebalanceStrategy, RequiredAcks};
pub use consumer::{
    Consumer, ConsumerGroup, GroupContext, HandlerBox, HandlerFuture, KafkaGroup, MessageHandler,
    MessageStream, OffsetMarker, PartitionClaim, Readiness, Session, ShutdownHandle, TopicRouter,
};
pub use error::{KafkaError, Result, TransportError};
pub use memory::{MemoryBroker, MemoryGroup, MemoryTransport};
pub use message::{
    Delivery, InboundMessage, OutboundMessage, TraceId, CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE,
    TRACE_ID_HEADER,
};
pub use producer::{KafkaTransport, Producer, Transport};

/// Re-export the event traits for convenience
pub use banking_events::{Event, EventType, RoutedEvent, TopicConfig};

/// Builds a [`TopicRouter`] mapping topics to typed handlers.
///
/// Each entry names a topic, the event type its payloads decode into and an
/// async handler taking that type. A payload that does not decode fails the
/// message like a handler error would.
///
/// # Example
///
/// ```no_run
/// use banking_kafka::topic_handlers;
/// use banking_events::{TransactionCompleted, UserCreated};
///
/// async fn handle_user_created(event: UserCreated) -> anyhow::Result<()> {
///     println!("User created: {:?}", event);
///     Ok(())
/// }
///
/// async fn handle_transaction(event: TransactionCompleted) -> anyhow::Result<()> {
///     println!("Transaction {} completed", event.transaction_id);
///     Ok(())
/// }
///
/// let handlers = topic_handlers![
///     "banking.users.events" => UserCreated => handle_user_created,
///     "banking.transactions.completed" => TransactionCompleted => handle_transaction,
/// ];
/// assert_eq!(handlers.len(), 2);
/// ```
#[macro_export]
macro_rules! topic_handlers {
    ($($topic:expr => $msg_type:ty => $handler:expr),* $(,)?) => {{
        let mut router = $crate::TopicRouter::new();
        $(
            let handler = ::std::sync::Arc::new($handler);
            let boxed: $crate::HandlerBox = ::std::boxed::Box::new(
                move |message: $crate::InboundMessage| -> $crate::HandlerFuture {
                    let handler = ::std::sync::Arc::clone(&handler);
                    ::std::boxed::Box::pin(async move {
                        let msg: $msg_type = message.decode()?;
                        (*handler)(msg)
                            .await
                            .map_err(|e| $crate::KafkaError::Handler(e.to_string()))
                    })
                },
            );
            router = router.route($topic, boxed);
        )*
        router
    }};
}
