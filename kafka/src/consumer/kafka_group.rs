//! Consumer group membership backed by an rdkafka `StreamConsumer`.
//!
//! A background driver task polls the consumer and turns rebalance callbacks
//! into [`Session`]s. Each assigned partition is fed through its own channel;
//! when a partition's backlog reaches the configured limit the partition is
//! paused at the broker, and resumed once its handler has caught up to half
//! the limit. A slow handler therefore only holds back its own partition.
//!
//! Offsets are stored locally on mark and committed by librdkafka's
//! auto-commit, which also commits on revocation and on close.

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer as RdConsumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{channel_stream, ConsumerGroup, OffsetMarker, PartitionClaim, Session};
use crate::config::ConsumerConfig;
use crate::error::{KafkaError, Result, TransportError};
use crate::message::InboundMessage;

type GroupConsumer = StreamConsumer<GroupContext>;

/// Rebalance notifications forwarded from librdkafka's callbacks.
#[derive(Debug)]
enum RebalanceEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
    Failed(String),
}

/// Client context forwarding rebalances to the driver task.
pub struct GroupContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let _ = self.events.send(RebalanceEvent::Revoked(partitions_of(tpl)));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let _ = self.events.send(RebalanceEvent::Assigned(partitions_of(tpl)));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                let _ = self.events.send(RebalanceEvent::Failed(e.to_string()));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, "Offset commit failed");
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

fn single_partition(topic: &str, partition: i32) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);
    tpl
}

/// [`ConsumerGroup`] implementation on top of librdkafka's group protocol.
///
/// Only eager assignment strategies are supported: every rebalance revokes
/// the whole assignment before handing out the next one.
pub struct KafkaGroup {
    consumer: Arc<GroupConsumer>,
    topics: Vec<String>,
    backlog_limit: usize,
    events: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
    sessions_tx: mpsc::UnboundedSender<Result<Session>>,
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Session>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl KafkaGroup {
    /// Creates the group client. Nothing is subscribed until the first join.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot
    /// be created.
    pub fn new(config: &ConsumerConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Creating Kafka consumer with brokers: {}, group: {}",
            config.brokers.join(","),
            config.group_id
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = GroupContext { events: events_tx };
        let consumer: GroupConsumer = config.to_client_config().create_with_context(context)?;
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            consumer: Arc::new(consumer),
            topics: config.topics.clone(),
            backlog_limit: config.max_partition_backlog,
            events: Mutex::new(Some(events_rx)),
            sessions_tx,
            sessions: tokio::sync::Mutex::new(sessions_rx),
            driver: Mutex::new(None),
            stop: CancellationToken::new(),
        })
    }

    /// Subscribes and spawns the driver task on first use.
    fn ensure_driver(&self) -> Result<()> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return Ok(());
        }

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| KafkaError::ConsumerGroup("consumer group already closed".to_string()))?;

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        info!("Subscribing to topics: {:?}", topics);
        self.consumer
            .subscribe(&topics)
            .map_err(|e| KafkaError::ConsumerGroup(format!("failed to subscribe: {e}")))?;

        let task = Driver {
            consumer: Arc::clone(&self.consumer),
            events,
            sessions: self.sessions_tx.clone(),
            backlog_limit: self.backlog_limit,
            stop: self.stop.clone(),
            generation: 0,
            current: None,
        };
        *driver = Some(tokio::spawn(task.run()));
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for KafkaGroup {
    async fn join(&self) -> Result<Session> {
        self.ensure_driver()?;
        let mut sessions = self.sessions.lock().await;
        match sessions.recv().await {
            Some(session) => session,
            None => Err(KafkaError::ConsumerGroup("group driver stopped".to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        info!("Closing consumer group membership");
        self.stop.cancel();

        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!(error = %e, "Consumer group driver task failed");
            }
        }

        // Pushes the offsets stored since the last auto-commit.
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(error = %e, "Nothing committed on close");
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}

impl Drop for KafkaGroup {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Backlog bookkeeping for one partition feed.
#[derive(Default)]
struct Backlog {
    depth: AtomicUsize,
    paused: AtomicBool,
}

struct PartitionFeed {
    tx: mpsc::UnboundedSender<InboundMessage>,
    backlog: Arc<Backlog>,
}

/// Resources of the generation currently being consumed.
struct ActiveGeneration {
    generation: u64,
    done: CancellationToken,
    feeds: HashMap<(String, i32), PartitionFeed>,
}

enum Step {
    Stop,
    Rebalance(RebalanceEvent),
    Message(KafkaResult<InboundMessage>),
}

struct Driver {
    consumer: Arc<GroupConsumer>,
    events: mpsc::UnboundedReceiver<RebalanceEvent>,
    sessions: mpsc::UnboundedSender<Result<Session>>,
    backlog_limit: usize,
    stop: CancellationToken,
    generation: u64,
    current: Option<ActiveGeneration>,
}

impl Driver {
    async fn run(mut self) {
        debug!("Consumer group driver started");

        loop {
            let step = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Step::Stop,
                Some(event) = self.events.recv() => Step::Rebalance(event),
                received = self.consumer.recv() => {
                    Step::Message(received.map(|message| inbound_from(&message)))
                }
            };

            match step {
                Step::Stop => break,
                Step::Rebalance(event) => {
                    if !self.on_rebalance(event) {
                        break;
                    }
                }
                Step::Message(Ok(message)) => {
                    if !self.deliver(message) {
                        break;
                    }
                }
                Step::Message(Err(e)) => {
                    warn!(error = %e, "Error receiving message");
                    // Outside a generation nobody else would see the failure.
                    if self.current.is_none() {
                        let err = KafkaError::Transport {
                            topic: "subscribed topics".to_string(),
                            operation: "consume",
                            source: TransportError::Kafka(e),
                        };
                        let _ = self.sessions.send(Err(KafkaError::ConsumerGroup(err.to_string())));
                    }
                }
            }
        }

        self.end_generation("consumer stopping");
        debug!("Consumer group driver stopped");
    }

    /// Returns false once nobody is waiting for sessions anymore.
    fn on_rebalance(&mut self, event: RebalanceEvent) -> bool {
        match event {
            RebalanceEvent::Assigned(partitions) => {
                self.end_generation("reassigned");
                let session = self.open_generation(partitions);
                self.sessions.send(Ok(session)).is_ok()
            }
            RebalanceEvent::Revoked(partitions) => {
                info!(partitions = partitions.len(), "Partitions revoked");
                self.end_generation("revoked");
                true
            }
            RebalanceEvent::Failed(reason) => {
                error!(error = %reason, "Rebalance failed");
                self.end_generation("rebalance failed");
                self.sessions
                    .send(Err(KafkaError::ConsumerGroup(format!("rebalance failed: {reason}"))))
                    .is_ok()
            }
        }
    }

    fn open_generation(&mut self, partitions: Vec<(String, i32)>) -> Session {
        self.generation += 1;
        let generation = self.generation;
        info!(generation, partitions = partitions.len(), "Partitions assigned");

        let done = CancellationToken::new();
        let mut feeds = HashMap::with_capacity(partitions.len());
        let mut claims = Vec::with_capacity(partitions.len());

        for (topic, partition) in partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            let backlog = Arc::new(Backlog::default());
            let drain = BacklogDrain {
                consumer: Arc::downgrade(&self.consumer),
                backlog: Arc::clone(&backlog),
                topic: topic.clone(),
                partition,
                resume_at: self.backlog_limit / 2,
            };
            let messages = channel_stream(rx)
                .inspect(move |_| drain.taken())
                .boxed();

            claims.push(PartitionClaim::new(topic.clone(), partition, messages));
            feeds.insert((topic, partition), PartitionFeed { tx, backlog });
        }

        self.current = Some(ActiveGeneration {
            generation,
            done: done.clone(),
            feeds,
        });

        let marker = Arc::new(KafkaMarker {
            consumer: Arc::downgrade(&self.consumer),
        });
        Session::new(generation, claims, marker, done)
    }

    fn end_generation(&mut self, reason: &str) {
        if let Some(active) = self.current.take() {
            info!(generation = active.generation, reason, "Generation ended");
            active.done.cancel();
            // Dropping the feeds closes every claim stream.
        }
    }

    /// Hands a fetched message to its claim. Returns false once nobody is
    /// waiting for sessions anymore.
    ///
    /// The assignment a message belongs to may still sit in the event queue,
    /// since rebalance callbacks run inside the poll that returned it.
    fn deliver(&mut self, message: InboundMessage) -> bool {
        while let Ok(event) = self.events.try_recv() {
            if !self.on_rebalance(event) {
                return false;
            }
        }

        if let Err(message) = self.dispatch(message) {
            self.rewind(&message);
        }
        true
    }

    /// Feeds the message to its partition's claim, or gives it back when no
    /// claim can take it.
    fn dispatch(&self, message: InboundMessage) -> std::result::Result<(), InboundMessage> {
        let Some(active) = self.current.as_ref() else {
            return Err(message);
        };

        let key = (message.topic.clone(), message.partition);
        let Some(feed) = active.feeds.get(&key) else {
            return Err(message);
        };

        if let Err(mpsc::error::SendError(message)) = feed.tx.send(message) {
            return Err(message);
        }

        let depth = feed.backlog.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth >= self.backlog_limit && !feed.backlog.paused.swap(true, Ordering::AcqRel) {
            debug!(topic = %key.0, partition = key.1, depth, "Pausing partition");
            if let Err(e) = self.consumer.pause(&single_partition(&key.0, key.1)) {
                warn!(topic = %key.0, partition = key.1, error = %e, "Failed to pause partition");
                feed.backlog.paused.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Seeks the partition back so the message is fetched again instead of
    /// being skipped by a later mark.
    fn rewind(&self, message: &InboundMessage) {
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "No claim for message, rewinding partition"
        );
        if let Err(e) = self.consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            Duration::ZERO,
        ) {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to rewind partition"
            );
        }
    }
}

/// Decrements a partition's backlog as its claim takes messages and resumes
/// the partition once the backlog is low enough.
struct BacklogDrain {
    consumer: Weak<GroupConsumer>,
    backlog: Arc<Backlog>,
    topic: String,
    partition: i32,
    resume_at: usize,
}

impl BacklogDrain {
    fn taken(&self) {
        let depth = self.backlog.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if depth > self.resume_at || !self.backlog.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        debug!(topic = %self.topic, partition = self.partition, depth, "Resuming partition");
        if let Err(e) = consumer.resume(&single_partition(&self.topic, self.partition)) {
            warn!(topic = %self.topic, partition = self.partition, error = %e, "Failed to resume partition");
        }
    }
}

/// Stores `offset + 1` for auto-commit.
struct KafkaMarker {
    consumer: Weak<GroupConsumer>,
}

impl OffsetMarker for KafkaMarker {
    fn mark(&self, message: &InboundMessage) -> Result<()> {
        let consumer = self
            .consumer
            .upgrade()
            .ok_or_else(|| KafkaError::ConsumerGroup("consumer closed".to_string()))?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))?;
        consumer.store_offsets(&tpl).map_err(|e| KafkaError::Transport {
            topic: message.topic.clone(),
            operation: "commit offsets for",
            source: TransportError::Kafka(e),
        })
    }
}

fn inbound_from(message: &BorrowedMessage<'_>) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_of_list() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("banking.transactions.initiated", 0);
        tpl.add_partition("banking.transactions.initiated", 1);
        tpl.add_partition("banking.audit.log", 4);

        assert_eq!(
            partitions_of(&tpl),
            vec![
                ("banking.transactions.initiated".to_string(), 0),
                ("banking.transactions.initiated".to_string(), 1),
                ("banking.audit.log".to_string(), 4),
            ]
        );
    }

    #[test]
    fn test_backlog_drain_resumes_only_when_paused() {
        let backlog = Arc::new(Backlog::default());
        backlog.depth.store(3, Ordering::SeqCst);
        let drain = BacklogDrain {
            consumer: Weak::new(),
            backlog: Arc::clone(&backlog),
            topic: "banking.audit.log".to_string(),
            partition: 0,
            resume_at: 1,
        };

        backlog.paused.store(true, Ordering::SeqCst);
        drain.taken();
        assert_eq!(backlog.depth.load(Ordering::SeqCst), 2);
        assert!(backlog.paused.load(Ordering::SeqCst));

        drain.taken();
        assert_eq!(backlog.depth.load(Ordering::SeqCst), 1);
        assert!(!backlog.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_new_group_validates_config() {
        let config = ConsumerConfig::new(["localhost:9092"], "");
        assert!(matches!(KafkaGroup::new(&config), Err(KafkaError::Config(_))));
    }

    fn audit_message(partition: i32, offset: i64) -> InboundMessage {
        InboundMessage {
            topic: "banking.audit.log".to_string(),
            partition,
            offset,
            key: None,
            payload: Vec::new(),
            headers: Vec::new(),
        }
    }

    fn audit_group() -> KafkaGroup {
        let config =
            ConsumerConfig::new(["localhost:9092"], "driver-test").with_topics(["banking.audit.log"]);
        KafkaGroup::new(&config).unwrap()
    }

    fn driver_for(
        group: &KafkaGroup,
        events: mpsc::UnboundedReceiver<RebalanceEvent>,
        sessions: mpsc::UnboundedSender<Result<Session>>,
    ) -> Driver {
        Driver {
            consumer: Arc::clone(&group.consumer),
            events,
            sessions,
            backlog_limit: 10,
            stop: group.stop.clone(),
            generation: 0,
            current: None,
        }
    }

    #[tokio::test]
    async fn test_marker_after_close_is_an_error() {
        let marker = KafkaMarker { consumer: Weak::new() };
        let message = audit_message(0, 1);
        assert!(matches!(marker.mark(&message), Err(KafkaError::ConsumerGroup(_))));
    }

    #[tokio::test]
    async fn test_message_fetched_before_assignment_event_reaches_its_claim() {
        let group = audit_group();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (sessions_tx, mut sessions) = mpsc::unbounded_channel();
        let mut driver = driver_for(&group, events, sessions_tx);

        // The assignment callback fired inside the poll that returned offset 7.
        events_tx
            .send(RebalanceEvent::Assigned(vec![("banking.audit.log".to_string(), 0)]))
            .unwrap();
        assert!(driver.deliver(audit_message(0, 7)));

        let session = sessions.recv().await.unwrap().unwrap();
        assert_eq!(session.generation(), 1);
        let (_, mut claims, _, _) = session.into_parts();
        let received = claims[0].next().await.unwrap();
        assert_eq!(received.offset, 7);

        // A partition outside the assignment is handed back, not fed.
        assert!(driver.dispatch(audit_message(3, 0)).is_err());
    }

    #[tokio::test]
    async fn test_dropping_group_stops_driver() {
        let group = audit_group();
        let stop = group.stop.clone();
        let (_events_tx, events) = mpsc::unbounded_channel();
        let (sessions_tx, _sessions) = mpsc::unbounded_channel();
        let driver = tokio::spawn(driver_for(&group, events, sessions_tx).run());

        drop(group);

        assert!(stop.is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("driver kept running after its group was dropped")
            .unwrap();
    }
}
