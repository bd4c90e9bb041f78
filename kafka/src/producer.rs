//! Circuit-breaking Kafka producer.

use async_trait::async_trait;
use banking_events::{Event, RoutedEvent, TopicConfig};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as RdProducer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::breaker::{BreakerError, BreakerSettings, CircuitBreaker, CircuitState};
use crate::config::ProducerConfig;
use crate::error::{KafkaError, Result, TransportError};
use crate::message::{Delivery, OutboundMessage, TraceId};

/// How long a send may wait for room in the client's local queue.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends messages to the log.
///
/// A returned error means the message was not durably written; given
/// all-replica acks, retrying it is safe.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> std::result::Result<Delivery, TransportError>;

    /// Waits until every queued message is acknowledged or `timeout` passes.
    fn flush(&self, timeout: Duration) -> std::result::Result<(), TransportError>;
}

/// [`Transport`] backed by an rdkafka `FutureProducer`.
pub struct KafkaTransport {
    inner: FutureProducer,
}

impl KafkaTransport {
    /// Creates a transport from a validated producer configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot
    /// be created.
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        config.validate()?;
        Self::from_config(config.to_client_config())
    }

    /// Creates a transport from a pre-built client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer cannot be created.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let inner: FutureProducer = config.create()?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, message: OutboundMessage) -> std::result::Result<Delivery, TransportError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            });

        let record = FutureRecord::to(&message.topic)
            .key(message.key.as_str())
            .payload(message.payload.as_slice())
            .headers(headers);

        match self.inner.send(record, QUEUE_TIMEOUT).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((kafka_err, _msg)) => Err(TransportError::Kafka(kafka_err)),
        }
    }

    fn flush(&self, timeout: Duration) -> std::result::Result<(), TransportError> {
        RdProducer::flush(&self.inner, timeout)?;
        Ok(())
    }
}

/// Event producer guarded by a circuit breaker.
///
/// Events are serialized to JSON, keyed by [`Event::key`] and sent with a
/// `content-type` and a `trace-id` header. Every send goes through one shared
/// [`CircuitBreaker`]; while it is open, publishing fails fast with
/// [`KafkaError::CircuitOpen`].
///
/// # Example
///
/// ```no_run
/// use banking_kafka::{Producer, ProducerConfig};
/// use banking_events::Event;
/// use serde::Serialize;
///
/// #[derive(Debug, Serialize)]
/// struct LoginFailed {
///     user_id: String,
/// }
///
/// impl Event for LoginFailed {
///     fn key(&self) -> String {
///         self.user_id.clone()
///     }
/// }
///
/// # async fn example() -> banking_kafka::Result<()> {
/// let producer = Producer::new(ProducerConfig::new(["localhost:9092"], "auth-service"))?;
/// let event = LoginFailed { user_id: "123".to_string() };
/// producer.publish("banking.security.events", &event).await?;
/// # Ok(())
/// # }
/// ```
pub struct Producer<T = KafkaTransport> {
    transport: T,
    breaker: CircuitBreaker,
}

impl Producer<KafkaTransport> {
    /// Creates a new Kafka producer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration breaks the delivery invariants or
    /// the client cannot be created.
    pub fn new(config: ProducerConfig) -> Result<Self> {
        info!(
            brokers = %config.brokers.join(","),
            client_id = %config.client_id,
            acks = config.required_acks.as_str(),
            idempotent = config.idempotent,
            "Creating Kafka producer"
        );

        let transport = KafkaTransport::new(&config)?;
        Ok(Self::with_transport(transport, config.breaker))
    }
}

impl<T: Transport> Producer<T> {
    /// Creates a producer over any transport with a logging breaker.
    pub fn with_transport(transport: T, breaker: BreakerSettings) -> Self {
        Self::with_breaker(transport, CircuitBreaker::new(breaker))
    }

    /// Creates a producer with a pre-built breaker, e.g. one with a custom
    /// state observer.
    pub fn with_breaker(transport: T, breaker: CircuitBreaker) -> Self {
        Self { transport, breaker }
    }

    /// Publishes one event under the current trace id.
    ///
    /// Inside a consumer handler this is the consumed message's trace id;
    /// elsewhere a fresh one is generated. Use [`Producer::publish_traced`]
    /// to propagate a trace id explicitly.
    ///
    /// # Errors
    ///
    /// * [`KafkaError::Serialization`] if the event cannot be encoded; the
    ///   breaker is not touched.
    /// * [`KafkaError::CircuitOpen`] if the breaker rejects the call.
    /// * [`KafkaError::Transport`] if the send fails.
    pub async fn publish<E: Event>(&self, topic: &str, event: &E) -> Result<Delivery> {
        self.publish_traced(topic, event, current_trace()).await
    }

    /// Publishes one event, propagating the caller's trace id.
    ///
    /// # Errors
    ///
    /// Same as [`Producer::publish`].
    pub async fn publish_traced<E: Event>(
        &self,
        topic: &str,
        event: &E,
        trace_id: TraceId,
    ) -> Result<Delivery> {
        let span = info_span!("kafka.publish", topic, trace_id = %trace_id);

        async move {
            let payload = event.to_payload().map_err(|e| {
                error!(topic, error = %e, "Failed to serialize event");
                KafkaError::Serialization(e.to_string())
            })?;

            let message = OutboundMessage::json(topic, event.key(), payload, &trace_id);
            debug!(
                "Sending message to topic '{}' ({} bytes)",
                topic,
                message.payload.len()
            );

            match self.breaker.call(|| self.transport.send(message)).await {
                Ok(delivery) => {
                    debug!(
                        topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Message sent"
                    );
                    Ok(delivery)
                }
                Err(BreakerError::Open | BreakerError::TooManyRequests) => {
                    error!(
                        topic,
                        breaker = self.breaker.name(),
                        "Failed to publish message: circuit breaker is open"
                    );
                    Err(KafkaError::CircuitOpen {
                        topic: topic.to_string(),
                        breaker: self.breaker.name().to_string(),
                    })
                }
                Err(BreakerError::Inner(source)) => {
                    error!(topic, error = %source, "Failed to publish message");
                    Err(KafkaError::Transport {
                        topic: topic.to_string(),
                        operation: "publish to",
                        source,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Publishes a catalog event to the topic its type routes to.
    ///
    /// # Errors
    ///
    /// Same as [`Producer::publish`].
    pub async fn publish_event<E: RoutedEvent>(&self, topics: &TopicConfig, event: &E) -> Result<Delivery> {
        self.publish(event.topic(topics), event).await
    }

    /// Publishes events one after another, stopping at the first failure.
    ///
    /// A batch is not atomic: when an error is returned, the events before the
    /// failing one have already been delivered and are not rolled back. All
    /// events of the batch share one trace id.
    ///
    /// # Errors
    ///
    /// Returns the error of the first event that failed.
    pub async fn publish_batch<E: Event>(&self, topic: &str, events: &[E]) -> Result<Vec<Delivery>> {
        let trace_id = current_trace();
        let span = info_span!(
            "kafka.publish_batch",
            topic,
            batch_size = events.len(),
            trace_id = %trace_id
        );

        async move {
            let mut deliveries = Vec::with_capacity(events.len());
            for (index, event) in events.iter().enumerate() {
                match self.publish_traced(topic, event, trace_id.clone()).await {
                    Ok(delivery) => deliveries.push(delivery),
                    Err(e) => {
                        warn!(
                            topic,
                            delivered = index,
                            not_sent = events.len() - index,
                            "Batch publish stopped at first failure"
                        );
                        return Err(e);
                    }
                }
            }
            Ok(deliveries)
        }
        .instrument(span)
        .await
    }

    /// True iff the circuit breaker is closed.
    pub fn is_healthy(&self) -> bool {
        self.breaker.is_healthy()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Flushes any pending messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.transport.flush(timeout).map_err(|source| KafkaError::Transport {
            topic: "pending messages".to_string(),
            operation: "flush",
            source,
        })
    }

    /// Flushes pending messages and releases the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails; the connection is released
    /// either way.
    pub fn close(self, timeout: Duration) -> Result<()> {
        info!(breaker = self.breaker.name(), "Closing Kafka producer");
        self.flush(timeout)
    }
}

fn current_trace() -> TraceId {
    TraceId::current().unwrap_or_else(TraceId::generate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Serialize, Serializer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Serialize)]
    struct MockEvent {
        id: String,
        data: String,
    }

    impl Event for MockEvent {
        fn key(&self) -> String {
            self.id.clone()
        }
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no wire form"))
        }
    }

    impl Event for Unserializable {
        fn key(&self) -> String {
            "unserializable".to_string()
        }
    }

    /// Records sent messages; fails while `failing` is set.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
        calls: AtomicUsize,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: OutboundMessage) -> std::result::Result<Delivery, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.failing.lock().unwrap() {
                return Err(TransportError::Unavailable("kafka error".to_string()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(message);
            Ok(Delivery {
                partition: 0,
                offset: sent.len() as i64 - 1,
            })
        }

        fn flush(&self, _timeout: Duration) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn event(id: &str) -> MockEvent {
        MockEvent {
            id: id.to_string(),
            data: "test-data".to_string(),
        }
    }

    fn producer() -> Producer<RecordingTransport> {
        Producer::with_transport(
            RecordingTransport::default(),
            BreakerSettings::new("kafka-producer-test").with_max_requests(1),
        )
    }

    #[tokio::test]
    async fn test_publish_success() {
        let p = producer();

        let delivery = p.publish("test-topic", &event("123")).await.unwrap();

        assert_eq!(delivery, Delivery { partition: 0, offset: 0 });
        assert!(p.is_healthy());
        let counts = p.breaker().counts();
        assert_eq!(counts.total_successes, 1);
        assert_eq!(counts.total_failures, 0);

        let sent = p.transport.sent.lock().unwrap();
        assert_eq!(sent[0].topic, "test-topic");
        assert_eq!(sent[0].key, "123");
        assert_eq!(sent[0].header("content-type"), Some("application/json"));
        assert!(TraceId::parse(sent[0].header("trace-id").unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_publish_uses_current_trace() {
        let p = producer();
        let trace_id = TraceId::generate();

        trace_id
            .clone()
            .scope(async {
                p.publish("test-topic", &event("1")).await.unwrap();
                p.publish_batch("test-topic", &[event("2")]).await.unwrap();
            })
            .await;
        p.publish("test-topic", &event("3")).await.unwrap();

        let sent = p.transport.sent.lock().unwrap();
        assert_eq!(sent[0].header("trace-id"), Some(trace_id.as_str()));
        assert_eq!(sent[1].header("trace-id"), Some(trace_id.as_str()));
        assert_ne!(sent[2].header("trace-id"), Some(trace_id.as_str()));
    }

    #[tokio::test]
    async fn test_publish_failure_wraps_topic_and_cause() {
        let p = producer();
        *p.transport.failing.lock().unwrap() = true;

        let err = p.publish("test-topic", &event("123")).await.unwrap_err();

        assert!(matches!(err, KafkaError::Transport { .. }));
        assert!(err.to_string().contains("test-topic"));
        assert!(err.to_string().contains("kafka error"));
        assert_eq!(p.breaker().counts().total_failures, 1);
    }

    #[tokio::test]
    async fn test_serialization_error_leaves_breaker_untouched() {
        let p = producer();

        let err = p.publish("test-topic", &Unserializable).await.unwrap_err();

        assert!(matches!(err, KafkaError::Serialization(_)));
        assert_eq!(p.breaker().counts().requests, 0);
        assert_eq!(p.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_sending() {
        let p = producer();
        *p.transport.failing.lock().unwrap() = true;
        for _ in 0..3 {
            p.publish("test-topic", &event("1")).await.unwrap_err();
        }
        assert_eq!(p.breaker_state(), CircuitState::Open);
        assert!(!p.is_healthy());

        *p.transport.failing.lock().unwrap() = false;
        let err = p.publish("test-topic", &event("1")).await.unwrap_err();

        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("test-topic"));
        assert_eq!(p.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_traced_publish_propagates_trace_id() {
        let p = producer();
        let trace_id = TraceId::generate();

        p.publish_traced("test-topic", &event("9"), trace_id.clone())
            .await
            .unwrap();

        let sent = p.transport.sent.lock().unwrap();
        assert_eq!(sent[0].header("trace-id"), Some(trace_id.as_str()));
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure_without_rollback() {
        let p = producer();
        let events = vec![event("a"), event("b"), event("c")];
        p.publish_batch("test-topic", &events[..1]).await.unwrap();

        *p.transport.failing.lock().unwrap() = true;
        let err = p.publish_batch("test-topic", &events).await.unwrap_err();

        assert!(matches!(err, KafkaError::Transport { .. }));
        // one attempt for "a", nothing for "b" and "c"
        assert_eq!(p.transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_shares_one_trace_id() {
        let p = producer();
        let deliveries = p
            .publish_batch("test-topic", &[event("a"), event("b")])
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 2);

        let sent = p.transport.sent.lock().unwrap();
        assert_eq!(sent[0].header("trace-id"), sent[1].header("trace-id"));
    }

    #[test]
    fn test_new_rejects_unsafe_idempotence() {
        let config = ProducerConfig::new(["localhost:9092"], "c").with_max_in_flight(5);
        assert!(matches!(Producer::new(config), Err(KafkaError::Config(_))));
    }
}
