//! Example consumer handling banking events.
//!
//! This example shows how to:
//! - Write typed handlers for catalog events
//! - Use the topic_handlers! macro to register handlers
//! - Start a Consumer and wait for its first generation
//! - Stop gracefully, letting in-flight handlers finish
//!
//! To run this example:
//! ```bash
//! cargo run --example consumer
//! ```
//!
//! Make sure you have a Kafka broker running on localhost:9092.
//! Run the producer example in another terminal to generate messages.

use banking_events::{Decimal, TopicConfig, TransactionCompleted, TransactionInitiated};
use banking_kafka::{topic_handlers, Consumer, ConsumerConfig};
use std::time::Duration;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Handler for TransactionInitiated events
async fn handle_initiated(event: TransactionInitiated) -> anyhow::Result<()> {
    info!(
        "Transaction initiated - ID: {}, User: {}, Amount: {} {}",
        event.transaction_id, event.user_id, event.amount, event.currency
    );

    // Simulate some processing work
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

/// Handler for TransactionCompleted events
async fn handle_completed(event: TransactionCompleted) -> anyhow::Result<()> {
    anyhow::ensure!(
        event.amount > Decimal::ZERO,
        "transaction {} completed without a positive amount",
        event.transaction_id
    );
    info!(
        "Transaction completed - ID: {} in {} ms",
        event.transaction_id, event.processing_time
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Kafka consumer example");

    let brokers = std::env::var("KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string());
    let group_id = std::env::var("KAFKA_GROUP_ID")
        .unwrap_or_else(|_| "notification-service".to_string());
    let topics = TopicConfig::default();

    let config = ConsumerConfig::new(brokers.split(','), group_id.as_str())
        .with_topics([
            topics.transaction_initiated.as_str(),
            topics.transaction_completed.as_str(),
        ])
        .with_handler_retries(3)
        .with_initial_backoff(Duration::from_millis(100))
        .with_max_backoff(Duration::from_secs(30));

    info!("Consumer config - Brokers: {}, Group: {}", brokers, group_id);

    let handlers = topic_handlers![
        topics.transaction_initiated.as_str() => TransactionInitiated => handle_initiated,
        topics.transaction_completed.as_str() => TransactionCompleted => handle_completed,
    ];

    let mut consumer = Consumer::new(config, handlers)?;
    consumer.start().await?;
    info!("Consumer joined the group. Press Ctrl+C to stop");

    signal::ctrl_c().await?;
    info!("Received shutdown signal (Ctrl+C)");

    consumer.stop().await?;
    info!("Consumer shut down gracefully");
    Ok(())
}
