//! Per-partition processing loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument};

use super::group::{OffsetMarker, PartitionClaim};
use super::handler::MessageHandler;
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::message::InboundMessage;

/// Why a claim loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimExit {
    /// The group stopped feeding the claim.
    Drained,
    /// The generation or the consumer was cancelled.
    Cancelled,
}

/// Retry policy applied to each handler invocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&ConsumerConfig> for RetryPolicy {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            max_retries: config.handler_retries,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

/// Feeds one claim's messages through the handler in offset order.
pub(crate) struct ClaimProcessor {
    handler: Arc<dyn MessageHandler>,
    marker: Arc<dyn OffsetMarker>,
    retry: RetryPolicy,
}

impl ClaimProcessor {
    pub(crate) fn new(handler: Arc<dyn MessageHandler>, marker: Arc<dyn OffsetMarker>, retry: RetryPolicy) -> Self {
        Self { handler, marker, retry }
    }

    /// Processes `claim` until it is drained or either token is cancelled.
    ///
    /// Cancellation is checked between messages only; a running handler is
    /// never interrupted.
    pub(crate) async fn run(
        &self,
        mut claim: PartitionClaim,
        session: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> ClaimExit {
        debug!(
            topic = claim.topic(),
            partition = claim.partition(),
            "Claim started"
        );

        // Offset of the first failed message; nothing at or after it is marked.
        let mut stalled_at: Option<i64> = None;

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return ClaimExit::Cancelled,
                _ = session.cancelled() => return ClaimExit::Cancelled,
                next = claim.next() => match next {
                    Some(message) => message,
                    None => {
                        debug!(topic = claim.topic(), partition = claim.partition(), "Claim drained");
                        return ClaimExit::Drained;
                    }
                },
            };

            let span = info_span!(
                "kafka.consume",
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                trace_id = field::Empty,
            );
            if let Some(trace_id) = message.trace_id() {
                span.record("trace_id", trace_id.as_str());
            }

            self.process(&message, &mut stalled_at).instrument(span).await;
        }
    }

    async fn process(&self, message: &InboundMessage, stalled_at: &mut Option<i64>) {
        let outcome = match message.trace_id() {
            Some(trace_id) => trace_id.scope(self.handle_with_retry(message)).await,
            None => self.handle_with_retry(message).await,
        };

        match outcome {
            Ok(()) => {
                if let Some(failed) = *stalled_at {
                    debug!(
                        failed_offset = failed,
                        "Message handled but not marked: an earlier offset failed"
                    );
                    return;
                }
                if let Err(e) = self.marker.mark(message) {
                    warn!(error = %e, "Failed to mark message");
                }
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to process message"
                );
                stalled_at.get_or_insert(message.offset);
            }
        }
    }

    /// Invokes the handler, retrying with exponential backoff.
    async fn handle_with_retry(&self, message: &InboundMessage) -> Result<()> {
        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            match self.handler.handle(message).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!("Message processed successfully after {} retries", attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;

                    if attempt > self.retry.max_retries {
                        return Err(e);
                    }

                    warn!(
                        "Error processing message (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, self.retry.max_retries, e, backoff
                    );

                    sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.retry.max_backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KafkaError;
    use crate::consumer::group::channel_stream;
    use crate::message::{OutboundMessage, TraceId};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingMarker {
        marked: Mutex<Vec<i64>>,
    }

    impl OffsetMarker for RecordingMarker {
        fn mark(&self, message: &InboundMessage) -> Result<()> {
            self.marked.lock().unwrap().push(message.offset);
            Ok(())
        }
    }

    /// Fails the offsets in `failing`, each `failures` times.
    struct FlakyHandler {
        failing: HashSet<i64>,
        failures: u32,
        attempts: Mutex<Vec<i64>>,
    }

    impl FlakyHandler {
        fn new(failing: &[i64], failures: u32) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                failures,
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, message: &InboundMessage) -> Result<()> {
            let mut attempts = self.attempts.lock().unwrap();
            let earlier = attempts.iter().filter(|&&o| o == message.offset).count() as u32;
            attempts.push(message.offset);
            if self.failing.contains(&message.offset) && earlier < self.failures {
                return Err(KafkaError::Handler(format!("offset {} rejected", message.offset)));
            }
            Ok(())
        }
    }

    fn message(offset: i64) -> InboundMessage {
        InboundMessage {
            topic: "banking.transactions.completed".to_string(),
            partition: 3,
            offset,
            key: Some(b"txn".to_vec()),
            payload: b"{}".to_vec(),
            headers: Vec::new(),
        }
    }

    fn claim_of(offsets: &[i64]) -> PartitionClaim {
        let (tx, rx) = mpsc::unbounded_channel();
        for &offset in offsets {
            tx.send(message(offset)).unwrap();
        }
        PartitionClaim::new("banking.transactions.completed", 3, channel_stream(rx))
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_marks_every_successful_message_in_order() {
        let handler = Arc::new(FlakyHandler::new(&[], 0));
        let marker = Arc::new(RecordingMarker::default());
        let processor = ClaimProcessor::new(handler.clone(), marker.clone(), no_retry());

        let exit = processor
            .run(claim_of(&[0, 1, 2]), &CancellationToken::new(), &CancellationToken::new())
            .await;

        assert_eq!(exit, ClaimExit::Drained);
        assert_eq!(*marker.marked.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failure_stops_marking_but_keeps_processing() {
        let handler = Arc::new(FlakyHandler::new(&[1], u32::MAX));
        let marker = Arc::new(RecordingMarker::default());
        let processor = ClaimProcessor::new(handler.clone(), marker.clone(), no_retry());

        processor
            .run(claim_of(&[0, 1, 2, 3]), &CancellationToken::new(), &CancellationToken::new())
            .await;

        assert_eq!(*handler.attempts.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(*marker.marked.lock().unwrap(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let handler = Arc::new(FlakyHandler::new(&[0], 2));
        let marker = Arc::new(RecordingMarker::default());
        let retry = RetryPolicy {
            max_retries: 3,
            ..no_retry()
        };
        let processor = ClaimProcessor::new(handler.clone(), marker.clone(), retry);

        processor
            .run(claim_of(&[0, 1]), &CancellationToken::new(), &CancellationToken::new())
            .await;

        assert_eq!(*handler.attempts.lock().unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(*marker.marked.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_cancelled_claim_leaves_buffered_messages() {
        let handler = Arc::new(FlakyHandler::new(&[], 0));
        let marker = Arc::new(RecordingMarker::default());
        let processor = ClaimProcessor::new(handler.clone(), marker.clone(), no_retry());
        let session = CancellationToken::new();
        session.cancel();

        let exit = processor
            .run(claim_of(&[0, 1]), &session, &CancellationToken::new())
            .await;

        assert_eq!(exit, ClaimExit::Cancelled);
        assert!(handler.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_runs_under_message_trace() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |_message: InboundMessage| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(TraceId::current());
                Ok::<(), KafkaError>(())
            }
        };
        let processor = ClaimProcessor::new(
            Arc::new(handler),
            Arc::new(RecordingMarker::default()),
            no_retry(),
        );

        let trace_id = TraceId::generate();
        let mut traced = InboundMessage::from(OutboundMessage::json(
            "banking.transactions.completed",
            "txn",
            b"{}".to_vec(),
            &trace_id,
        ));
        traced.partition = 3;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(traced).unwrap();
        tx.send(message(1)).unwrap();
        drop(tx);
        let claim = PartitionClaim::new("banking.transactions.completed", 3, channel_stream(rx));

        let exit = processor
            .run(claim, &CancellationToken::new(), &CancellationToken::new())
            .await;

        assert_eq!(exit, ClaimExit::Drained);
        assert_eq!(*seen.lock().unwrap(), vec![Some(trace_id), None]);
    }

    #[tokio::test]
    async fn test_open_claim_waits_for_shutdown() {
        let handler = Arc::new(FlakyHandler::new(&[], 0));
        let marker = Arc::new(RecordingMarker::default());
        let processor = ClaimProcessor::new(handler.clone(), marker.clone(), no_retry());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(message(0)).unwrap();
        let claim = PartitionClaim::new("banking.transactions.completed", 3, channel_stream(rx));
        let shutdown = CancellationToken::new();

        let stopper = shutdown.clone();
        let run = tokio::spawn(async move {
            processor.run(claim, &CancellationToken::new(), &stopper).await
        });
        while marker.marked.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        // the stream is still open, so the claim keeps waiting
        assert!(!run.is_finished());

        shutdown.cancel();

        assert_eq!(run.await.unwrap(), ClaimExit::Cancelled);
        assert_eq!(*marker.marked.lock().unwrap(), vec![0]);
        drop(tx);
    }
}
