//! Example producer publishing banking events.
//!
//! This example shows how to:
//! - Configure a Producer with all-replica acks and idempotence
//! - Publish catalog events routed by their event type
//! - Propagate a trace id across related events
//! - Watch the circuit breaker state
//!
//! To run this example:
//! ```bash
//! cargo run --example producer
//! ```
//!
//! Make sure you have a Kafka broker running on localhost:9092.

use banking_events::{
    BaseEvent, Decimal, EventMetadata, EventType, TopicConfig, TransactionCompleted,
    TransactionInitiated,
};
use banking_kafka::{Producer, ProducerConfig, TraceId};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Kafka producer example");

    let brokers = std::env::var("KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string());

    let config = ProducerConfig::new(brokers.split(','), "transaction-service");
    let producer = Producer::new(config)?;
    let topics = TopicConfig::default();
    info!("Producer created successfully");

    let user_id = Uuid::new_v4();
    for i in 1..=3i64 {
        let transaction_id = Uuid::new_v4();
        let trace_id = TraceId::generate();

        let initiated = TransactionInitiated {
            base: BaseEvent::new(EventType::TransactionInitiated, "transaction-service"),
            transaction_id,
            user_id,
            from_account_id: Uuid::new_v4(),
            to_account_id: Uuid::new_v4(),
            amount: Decimal::new(10_000 * i, 2),
            currency: "USD".to_string(),
            transfer_type: "internal".to_string(),
            memo: Some(format!("transfer {i}")),
            metadata: EventMetadata::default(),
        };

        // Every event of one user lands on one partition, in order.
        let topic = topics.transaction_initiated.as_str();
        let delivery = producer
            .publish_traced(topic, &initiated, trace_id.clone())
            .await?;
        info!(
            "Transaction {} initiated (partition: {}, offset: {})",
            transaction_id, delivery.partition, delivery.offset
        );

        let completed = TransactionCompleted {
            base: BaseEvent::new(EventType::TransactionCompleted, "transaction-service")
                .with_causation(initiated.base.event_id.to_string()),
            transaction_id,
            user_id,
            amount: initiated.amount,
            currency: initiated.currency.clone(),
            processing_time: 42,
        };
        if let Err(e) = producer.publish_event(&topics, &completed).await {
            warn!("Failed to publish completion: {}", e);
        }

        info!("Circuit breaker is {}", producer.breaker_state());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Flushing pending messages");
    producer.close(Duration::from_secs(5))?;

    info!("All messages sent successfully!");
    Ok(())
}
