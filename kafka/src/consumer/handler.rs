//! Message handlers and topic routing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

use crate::error::Result;
use crate::message::InboundMessage;

/// Application callback invoked once per consumed message.
///
/// Returning `Ok` lets the consumer commit the message; returning `Err` keeps
/// it (and everything after it on the same partition) uncommitted so it is
/// redelivered after the next rebalance or restart.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        (self)(message.clone()).await
    }
}

/// Boxed future returned by a [`HandlerBox`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Type alias for per-topic handlers.
///
/// Handlers are async functions that take a consumed message and return a Result.
pub type HandlerBox = Box<dyn Fn(InboundMessage) -> HandlerFuture + Send + Sync>;

/// Routes each message to the handler registered for its topic.
///
/// Usually built with [`topic_handlers!`](crate::topic_handlers).
#[derive(Default)]
pub struct TopicRouter {
    handlers: HashMap<String, HandlerBox>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`, replacing any earlier registration.
    pub fn route(mut self, topic: impl Into<String>, handler: HandlerBox) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    /// Topics with a registered handler, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl From<HashMap<String, HandlerBox>> for TopicRouter {
    fn from(handlers: HashMap<String, HandlerBox>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl MessageHandler for TopicRouter {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        match self.handlers.get(&message.topic) {
            Some(handler) => handler(message.clone()).await,
            None => {
                // Unrouted messages are skipped so they cannot pin the partition.
                warn!("No handler registered for topic '{}'", message.topic);
                Ok(())
            }
        }
    }
}
