//! Consumer group coordinator.
//!
//! A [`Consumer`] owns a supervising task that repeatedly joins its
//! [`ConsumerGroup`], runs one task per claimed partition for the generation,
//! waits for all of them when the generation ends, and rejoins. Handlers run
//! strictly in offset order per partition; partitions are independent.

mod claim;
mod group;
mod handler;
mod kafka_group;

pub use group::{ConsumerGroup, MessageStream, OffsetMarker, PartitionClaim, Session};
pub use handler::{HandlerBox, HandlerFuture, MessageHandler, TopicRouter};
pub use kafka_group::{GroupContext, KafkaGroup};

pub(crate) use group::channel_stream;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{KafkaError, Result};
use claim::{ClaimExit, ClaimProcessor, RetryPolicy};

/// Membership state reported by [`Consumer::readiness`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Waiting for an assignment. `generations` counts the generations that
    /// were already set up.
    Joining { generations: u64 },
    /// Claims of this generation are being consumed.
    Ready { generation: u64 },
    /// The first join failed; the consumer will not retry.
    Failed(String),
    /// The supervising task has exited.
    Stopped,
}

impl Readiness {
    fn settled(&self) -> bool {
        !matches!(self, Readiness::Joining { generations: 0 })
    }
}

/// Consumer group member running a [`MessageHandler`] over every claim.
///
/// # Example
///
/// ```no_run
/// use banking_kafka::{topic_handlers, Consumer, ConsumerConfig};
/// use banking_events::UserCreated;
///
/// async fn handle_user_created(event: UserCreated) -> anyhow::Result<()> {
///     println!("User created: {}", event.user_id);
///     Ok(())
/// }
///
/// # async fn example() -> banking_kafka::Result<()> {
/// let config = ConsumerConfig::new(["localhost:9092"], "notification-service")
///     .with_topics(["banking.users.events"]);
/// let handlers = topic_handlers![
///     "banking.users.events" => UserCreated => handle_user_created,
/// ];
///
/// let mut consumer = Consumer::new(config, handlers)?;
/// consumer.start().await?;
/// tokio::signal::ctrl_c().await.ok();
/// consumer.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer<G: ConsumerGroup = KafkaGroup> {
    group: Arc<G>,
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
    backoff: (Duration, Duration),
    shutdown: CancellationToken,
    readiness: Arc<watch::Sender<Readiness>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Consumer<KafkaGroup> {
    /// Creates a consumer backed by a Kafka consumer group.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot
    /// be created.
    pub fn new(config: ConsumerConfig, handler: impl MessageHandler) -> Result<Self> {
        let group = KafkaGroup::new(&config)?;
        Ok(Self::with_group(group, &config, handler))
    }
}

impl<G: ConsumerGroup> Consumer<G> {
    /// Creates a consumer over any group implementation. Only the retry and
    /// backoff settings of `config` are used.
    pub fn with_group(group: G, config: &ConsumerConfig, handler: impl MessageHandler) -> Self {
        let (readiness, _) = watch::channel(Readiness::Joining { generations: 0 });
        Self {
            group: Arc::new(group),
            handler: Arc::new(handler),
            retry: RetryPolicy::from(config),
            backoff: (config.initial_backoff, config.max_backoff),
            shutdown: CancellationToken::new(),
            readiness: Arc::new(readiness),
            supervisor: None,
        }
    }

    /// Joins the group and starts consuming in the background.
    ///
    /// Returns once the first generation is set up. Later membership failures
    /// are logged and retried with backoff.
    ///
    /// # Errors
    ///
    /// * [`KafkaError::ConsumerGroup`] if the first join fails.
    /// * [`KafkaError::Shutdown`] if the consumer was shut down first.
    /// * [`KafkaError::Other`] if the consumer was already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.supervisor.is_some() {
            return Err(KafkaError::Other("consumer already started".to_string()));
        }

        // A failed earlier attempt leaves its state behind.
        self.readiness.send_replace(Readiness::Joining { generations: 0 });
        let mut readiness = self.readiness.subscribe();
        let supervisor = Supervisor {
            group: Arc::clone(&self.group),
            handler: Arc::clone(&self.handler),
            retry: self.retry,
            initial_backoff: self.backoff.0,
            max_backoff: self.backoff.1,
            shutdown: self.shutdown.clone(),
            readiness: Arc::clone(&self.readiness),
            generations: 0,
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));

        let state = readiness
            .wait_for(Readiness::settled)
            .await
            .map(|state| (*state).clone())
            .map_err(|_| KafkaError::Shutdown("consumer supervisor exited".to_string()))?;

        match state {
            Readiness::Failed(reason) => {
                if let Some(supervisor) = self.supervisor.take() {
                    let _ = supervisor.await;
                }
                Err(KafkaError::ConsumerGroup(reason))
            }
            Readiness::Stopped => Err(KafkaError::Shutdown(
                "consumer stopped before joining".to_string(),
            )),
            Readiness::Ready { .. } | Readiness::Joining { .. } => {
                info!("Consumer started");
                Ok(())
            }
        }
    }

    /// Whether a generation is currently set up.
    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready { .. })
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Returns a handle that can request shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Stops consuming and leaves the group.
    ///
    /// Waits for in-flight handlers to finish; messages still buffered are
    /// left uncommitted and redelivered to the next owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervising task failed or the group could not
    /// be closed cleanly.
    pub async fn stop(mut self) -> Result<()> {
        info!("Requesting consumer shutdown");
        self.shutdown.cancel();

        if let Some(supervisor) = self.supervisor.take() {
            supervisor
                .await
                .map_err(|e| KafkaError::Shutdown(format!("supervisor task failed: {e}")))?;
        }

        self.group.close().await?;
        info!("Consumer stopped");
        Ok(())
    }
}

impl<G: ConsumerGroup> Drop for Consumer<G> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle for requesting consumer shutdown from another task.
///
/// The owner still calls [`Consumer::stop`] to wait for handlers and leave
/// the group.
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Requests a graceful shutdown of the consumer.
    pub fn shutdown(&self) {
        info!("Requesting consumer shutdown via handle");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Join, consume, rejoin loop run on its own task.
struct Supervisor<G> {
    group: Arc<G>,
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
    initial_backoff: Duration,
    max_backoff: Duration,
    shutdown: CancellationToken,
    readiness: Arc<watch::Sender<Readiness>>,
    generations: u64,
}

impl<G: ConsumerGroup> Supervisor<G> {
    async fn run(mut self) {
        let mut backoff = self.initial_backoff;

        loop {
            self.readiness.send_replace(Readiness::Joining {
                generations: self.generations,
            });

            let joined = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = self.group.join() => joined,
            };

            match joined {
                Ok(session) => {
                    backoff = self.initial_backoff;
                    self.run_session(session).await;
                }
                Err(e) if self.generations == 0 => {
                    error!(error = %e, "Failed to join consumer group");
                    let reason = match e {
                        KafkaError::ConsumerGroup(reason) => reason,
                        other => other.to_string(),
                    };
                    self.readiness.send_replace(Readiness::Failed(reason));
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Consumer group error, rejoining in {:?}", backoff);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        self.readiness.send_replace(Readiness::Stopped);
        info!("Consumer supervisor stopped");
    }

    async fn run_session(&mut self, session: Session) {
        let (generation, claims, marker, done) = session.into_parts();

        // Setup
        self.generations += 1;
        self.readiness.send_replace(Readiness::Ready { generation });
        info!(generation, claims = claims.len(), "Consumer group session ready");

        let processor = Arc::new(ClaimProcessor::new(
            Arc::clone(&self.handler),
            marker,
            self.retry,
        ));
        let mut tasks = JoinSet::new();
        for claim in claims {
            let processor = Arc::clone(&processor);
            let done = done.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                if processor.run(claim, &done, &shutdown).await == ClaimExit::Drained {
                    // One drained claim ends the generation for all of them.
                    done.cancel();
                }
            });
        }

        if tasks.is_empty() {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(generation, error = %e, "Partition claim task failed");
            }
        }

        // Cleanup
        info!(generation, "Consumer group session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::message::{InboundMessage, OutboundMessage, TraceId};
    use crate::producer::Transport;
    use std::sync::Mutex;
    use tokio::time::timeout;

    fn config() -> ConsumerConfig {
        ConsumerConfig::new(["memory"], "coordinator-test")
            .with_topics(["t"])
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(40))
    }

    fn recording() -> (Arc<Mutex<Vec<i64>>>, impl MessageHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |message: InboundMessage| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(message.offset);
                Ok::<(), KafkaError>(())
            }
        };
        (seen, handler)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_reports_ready_and_stop_closes() {
        let broker = MemoryBroker::new(1);
        let (_, handler) = recording();
        let mut consumer = Consumer::with_group(broker.group(["t"]), &config(), handler);

        assert!(!consumer.is_ready());
        consumer.start().await.unwrap();
        assert!(consumer.is_ready());
        assert!(matches!(
            consumer.start().await,
            Err(KafkaError::Other(_))
        ));

        consumer.stop().await.unwrap();
        assert_eq!(broker.generation(), 1);
    }

    #[tokio::test]
    async fn test_first_join_failure_is_returned_from_start() {
        let broker = MemoryBroker::new(1);
        broker.fail_next_joins(1);
        let (_, handler) = recording();
        let mut consumer = Consumer::with_group(broker.group(["t"]), &config(), handler);

        let err = consumer.start().await.unwrap_err();

        assert_eq!(err.to_string(), "Consumer group error: injected join failure");
        assert_eq!(
            consumer.readiness(),
            Readiness::Failed("injected join failure".to_string())
        );
        assert!(!consumer.is_ready());
    }

    #[tokio::test]
    async fn test_start_can_be_retried_after_failed_join() {
        let broker = MemoryBroker::new(1);
        broker.fail_next_joins(1);
        let (_, handler) = recording();
        let mut consumer = Consumer::with_group(broker.group(["t"]), &config(), handler);

        assert!(consumer.start().await.is_err());

        timeout(Duration::from_secs(5), consumer.start())
            .await
            .expect("second start did not return")
            .unwrap();
        assert!(consumer.is_ready());
        assert_eq!(broker.generation(), 1);

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_rejoins_and_resumes_from_commit() {
        let broker = MemoryBroker::new(1);
        let transport = broker.transport();
        let (seen, handler) = recording();
        let mut consumer = Consumer::with_group(broker.group(["t"]), &config(), handler);
        consumer.start().await.unwrap();

        for body in ["a", "b"] {
            let message = OutboundMessage::json("t", "k", body.as_bytes().to_vec(), &TraceId::generate());
            transport.send(message).await.unwrap();
        }
        eventually(|| broker.committed("t", 0) == Some(2)).await;

        broker.fail_next_joins(2);
        broker.rebalance();
        eventually(|| broker.generation() == 2).await;
        let message = OutboundMessage::json("t", "k", b"c".to_vec(), &TraceId::generate());
        transport.send(message).await.unwrap();
        eventually(|| broker.committed("t", 0) == Some(3)).await;

        // nothing committed is redelivered
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_supervisor() {
        let broker = MemoryBroker::new(1);
        let (_, handler) = recording();
        let mut consumer = Consumer::with_group(broker.group(["t"]), &config(), handler);
        consumer.start().await.unwrap();

        let handle = consumer.shutdown_handle();
        handle.shutdown();
        assert!(handle.is_shutdown());

        let mut readiness = consumer.readiness.subscribe();
        timeout(
            Duration::from_secs(5),
            readiness.wait_for(|state| *state == Readiness::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        consumer.stop().await.unwrap();
    }
}
