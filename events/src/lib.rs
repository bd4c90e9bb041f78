//! Banking domain events and the capability trait the Kafka client publishes.
//!
//! Anything that can be published implements [`Event`]: it exposes a stable
//! partition key and a JSON body. Events that belong to the banking catalog
//! additionally implement [`RoutedEvent`] so their topic can be looked up in a
//! [`TopicConfig`].

mod catalog;
mod events;

use serde::Serialize;

pub use catalog::{EventType, TopicConfig};
pub use rust_decimal::Decimal;
pub use events::{
    AuditLog, BaseEvent, EventMetadata, FraudAnalysisComplete, TransactionCompleted,
    TransactionInitiated, UserCreated, EVENT_VERSION,
};

/// Trait for types that can be published as Kafka messages.
///
/// Messages with the same key always land in the same partition, so the key
/// decides the ordering domain of an event (e.g. the user id for transfers).
///
/// # Example
///
/// ```
/// use banking_events::Event;
/// use serde::Serialize;
///
/// #[derive(Debug, Serialize)]
/// struct AccountFrozen {
///     account_id: String,
///     reason: String,
/// }
///
/// impl Event for AccountFrozen {
///     fn key(&self) -> String {
///         self.account_id.clone()
///     }
/// }
///
/// let event = AccountFrozen { account_id: "acc-1".into(), reason: "aml".into() };
/// assert_eq!(event.key(), "acc-1");
/// assert!(event.to_payload().is_ok());
/// ```
pub trait Event: Serialize + Send + Sync {
    /// Partition key for this event.
    fn key(&self) -> String;

    /// Serializes the event body to JSON bytes.
    fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// An [`Event`] that knows its catalog type and can therefore be routed to a
/// topic without the caller naming one.
pub trait RoutedEvent: Event {
    fn event_type(&self) -> EventType;

    /// Topic this event is published to under `topics`.
    fn topic<'a>(&self, topics: &'a TopicConfig) -> &'a str {
        self.event_type().topic(topics)
    }
}
