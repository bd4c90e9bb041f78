//! Consumer group membership seam.
//!
//! A [`ConsumerGroup`] hands out one [`Session`] per generation. A session
//! carries a [`PartitionClaim`] per assigned partition, an [`OffsetMarker`]
//! for committing progress and a token the group cancels when the generation
//! is revoked.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::InboundMessage;

/// Ordered message stream of one claimed partition.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// Adapts a channel receiver into a [`MessageStream`] that ends when every
/// sender is dropped.
pub(crate) fn channel_stream(rx: mpsc::UnboundedReceiver<InboundMessage>) -> MessageStream {
    futures::stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        Some((message, rx))
    })
    .boxed()
}

/// Group membership as seen by the consumer coordinator.
#[async_trait]
pub trait ConsumerGroup: Send + Sync + 'static {
    /// Joins the group (or rejoins after a revocation) and waits for the next
    /// generation's assignment.
    ///
    /// # Errors
    ///
    /// Returns [`KafkaError::ConsumerGroup`](crate::KafkaError::ConsumerGroup)
    /// if membership cannot be established.
    async fn join(&self) -> Result<Session>;

    /// Leaves the group, flushing committed progress.
    async fn close(&self) -> Result<()>;
}

/// Records that a message was fully processed.
///
/// Marking message `n` commits offset `n + 1`, the next one to consume.
pub trait OffsetMarker: Send + Sync {
    fn mark(&self, message: &InboundMessage) -> Result<()>;
}

/// One partition of a generation's assignment.
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    messages: MessageStream,
}

impl PartitionClaim {
    pub fn new(topic: impl Into<String>, partition: i32, messages: MessageStream) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next message in offset order; `None` once the group stopped feeding
    /// this claim.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.messages.next().await
    }
}

impl fmt::Debug for PartitionClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionClaim")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

/// One generation of group membership.
pub struct Session {
    generation: u64,
    claims: Vec<PartitionClaim>,
    marker: Arc<dyn OffsetMarker>,
    done: CancellationToken,
}

impl Session {
    pub fn new(
        generation: u64,
        claims: Vec<PartitionClaim>,
        marker: Arc<dyn OffsetMarker>,
        done: CancellationToken,
    ) -> Self {
        Self {
            generation,
            claims,
            marker,
            done,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn claims(&self) -> &[PartitionClaim] {
        &self.claims
    }

    /// Cancelled by the group when this generation's assignment is revoked.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub(crate) fn into_parts(self) -> (u64, Vec<PartitionClaim>, Arc<dyn OffsetMarker>, CancellationToken) {
        (self.generation, self.claims, self.marker, self.done)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("claims", &self.claims)
            .field("done", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}
