//! In-process broker for tests and local development.
//!
//! [`MemoryBroker`] keeps an append-only log per topic partition and
//! committed offsets per partition. [`MemoryTransport`] publishes into it and
//! [`MemoryGroup`] is a single-member consumer group over it: each join
//! replays every assigned partition from its committed offset and then
//! follows new appends. Failures can be injected on both sides.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consumer::{channel_stream, ConsumerGroup, OffsetMarker, PartitionClaim, Session};
use crate::error::{KafkaError, Result, TransportError};
use crate::message::{Delivery, InboundMessage, OutboundMessage};
use crate::producer::Transport;

type PartitionKey = (String, i32);

struct ActiveGeneration {
    generation: u64,
    done: CancellationToken,
    feeds: HashMap<PartitionKey, mpsc::UnboundedSender<InboundMessage>>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Vec<InboundMessage>>>,
    committed: HashMap<PartitionKey, i64>,
    failing_sends: usize,
    unavailable: bool,
    failing_joins: usize,
    generation: u64,
    active: Option<ActiveGeneration>,
}

impl BrokerState {
    fn partitions_of(&mut self, topic: &str, partitions: i32) -> &mut Vec<Vec<InboundMessage>> {
        self.logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize])
    }

    fn end_generation(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(generation = active.generation, "Memory generation revoked");
            active.done.cancel();
        }
    }
}

/// Shared in-memory log. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    partitions: i32,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates a broker where every topic has `partitions` partitions.
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { broker: self.clone() }
    }

    /// A single-member group consuming `topics`.
    pub fn group<I>(&self, topics: I) -> MemoryGroup
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        MemoryGroup {
            broker: self.clone(),
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Every message stored for `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        self.lock()
            .logs
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed offset of a partition: the next offset a new generation reads.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock().committed.get(&(topic.to_string(), partition)).copied()
    }

    /// Makes the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    /// While unavailable, every send fails.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Makes the next `count` joins fail.
    pub fn fail_next_joins(&self, count: usize) {
        self.lock().failing_joins = count;
    }

    /// Revokes the current generation, as a broker-side rebalance would.
    pub fn rebalance(&self) {
        info!("Triggering memory rebalance");
        self.lock().end_generation();
    }

    /// Generation of the last successful join; 0 before the first.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

/// [`Transport`] appending to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: OutboundMessage) -> std::result::Result<Delivery, TransportError> {
        let partition = self.broker.partition_for(&message.key);
        let partitions = self.broker.partitions;
        let mut state = self.broker.lock();

        if state.unavailable {
            return Err(TransportError::Unavailable("memory broker is down".to_string()));
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(TransportError::Unavailable("injected send failure".to_string()));
        }

        let log = &mut state.partitions_of(&message.topic, partitions)[partition as usize];
        let mut stored = InboundMessage::from(message);
        stored.partition = partition;
        stored.offset = log.len() as i64;
        log.push(stored.clone());

        let delivery = Delivery {
            partition,
            offset: stored.offset,
        };
        if let Some(active) = &state.active {
            if let Some(feed) = active.feeds.get(&(stored.topic.clone(), partition)) {
                let _ = feed.send(stored);
            }
        }
        Ok(delivery)
    }

    fn flush(&self, _timeout: Duration) -> std::result::Result<(), TransportError> {
        Ok(())
    }
}

/// Single-member [`ConsumerGroup`] over a [`MemoryBroker`].
pub struct MemoryGroup {
    broker: MemoryBroker,
    topics: Vec<String>,
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn join(&self) -> Result<Session> {
        let partitions = self.broker.partitions;
        let mut state = self.broker.lock();

        if state.failing_joins > 0 {
            state.failing_joins -= 1;
            return Err(KafkaError::ConsumerGroup("injected join failure".to_string()));
        }

        state.end_generation();
        state.generation += 1;
        let generation = state.generation;
        let done = CancellationToken::new();
        let mut feeds = HashMap::new();
        let mut claims = Vec::new();

        for topic in &self.topics {
            for partition in 0..partitions {
                let start = state
                    .committed
                    .get(&(topic.clone(), partition))
                    .copied()
                    .unwrap_or(0);
                let (tx, rx) = mpsc::unbounded_channel();
                // Replay and registration happen under one lock, so no append is missed.
                for message in state.partitions_of(topic, partitions)[partition as usize]
                    .iter()
                    .skip(start as usize)
                {
                    let _ = tx.send(message.clone());
                }
                feeds.insert((topic.clone(), partition), tx);
                claims.push(PartitionClaim::new(topic.clone(), partition, channel_stream(rx)));
            }
        }

        state.active = Some(ActiveGeneration {
            generation,
            done: done.clone(),
            feeds,
        });
        info!(generation, claims = claims.len(), "Joined memory consumer group");

        let marker = Arc::new(MemoryMarker {
            broker: self.broker.clone(),
            generation,
        });
        Ok(Session::new(generation, claims, marker, done))
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().end_generation();
        Ok(())
    }
}

/// Commits into the broker while its generation is still current.
struct MemoryMarker {
    broker: MemoryBroker,
    generation: u64,
}

impl OffsetMarker for MemoryMarker {
    fn mark(&self, message: &InboundMessage) -> Result<()> {
        let mut state = self.broker.lock();
        let current = state.active.as_ref().map(|active| active.generation);
        if current != Some(self.generation) {
            return Err(KafkaError::ConsumerGroup(format!(
                "generation {} is no longer active",
                self.generation
            )));
        }
        state
            .committed
            .insert((message.topic.clone(), message.partition), message.offset + 1);
        Ok(())
    }
}
