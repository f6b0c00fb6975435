//! Consumer contract and the stop protocol.
//!
//! A consumer run moves through `Running -> Stopping -> Stopped`. The handler
//! decides what happens to each message by returning a [`HandlerOutcome`]:
//!
//! - `Continue`: the message is acknowledged (ack-after-success) and the loop
//!   carries on.
//! - `Stop { ack }`: the message is acknowledged if `ack` is set, otherwise left
//!   for redelivery, and `run` returns `Ok(())`.
//!
//! Any handler error ends the run immediately and is returned unchanged inside
//! [`ConsumerError::Handler`]. The loop never retries on its own; that belongs
//! to whoever supervises it. Dropping the `run` future leaves the in-flight
//! message unacknowledged, exactly as a crash would.

use crate::error::{ConsumerError, MessagingError};
use crate::message::{Delivery, Message, TopicName};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// What the handler wants done after processing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerOutcome {
    /// Acknowledge and keep consuming
    #[default]
    Continue,
    /// End the run, acknowledging the current message only if `ack` is set
    Stop { ack: bool },
}

/// Callback invoked once per received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    async fn handle(&self, message: Message) -> anyhow::Result<HandlerOutcome> {
        (self)(message).await
    }
}

/// Phase of a consumer run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created but never run
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Long-running receive loop bound to a topic and subscription
#[async_trait]
pub trait Consumer: Send {
    /// Topic this consumer reads
    fn topic(&self) -> &TopicName;

    /// Current phase
    fn state(&self) -> ConsumerState;

    /// Deliver messages to `handler` until it stops the run or fails
    async fn run(&mut self, handler: &dyn MessageHandler) -> Result<(), ConsumerError>;
}

/// Where a newly created subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Oldest retained message
    Earliest,
    /// Only messages published after the subscription exists
    Latest,
}

/// Backend-specific consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Consumer name within the group; defaults to the topic
    pub name: Option<String>,
    /// Subscription / consumer group; defaults to the topic
    pub group: Option<String>,
    /// Maximum messages pulled per receive
    pub batch_size: usize,
    /// How long one receive waits for new messages before polling again
    pub block: Duration,
    /// Reclaim messages left pending by other consumers before reading new ones
    pub process_pending_messages: bool,
    /// Minimum idle time before a pending message may be reclaimed
    pub min_idle_time: Duration,
    /// Start position used when the group does not exist yet
    pub start_position: StartPosition,
    /// Acknowledge after every `Continue`
    pub auto_acknowledge: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            name: None,
            group: None,
            batch_size: 1,
            block: Duration::from_secs(1),
            process_pending_messages: false,
            min_idle_time: Duration::from_secs(1),
            start_position: StartPosition::Earliest,
            auto_acknowledge: true,
        }
    }
}

impl ConsumerOptions {
    /// Create new options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set consumer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set subscription / consumer group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set receive batch size (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set receive block timeout
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Reclaim pending messages before reading new ones
    pub fn process_pending_messages(mut self, enabled: bool) -> Self {
        self.process_pending_messages = enabled;
        self
    }

    /// Set minimum idle time for reclaiming
    pub fn with_min_idle_time(mut self, min_idle_time: Duration) -> Self {
        self.min_idle_time = min_idle_time;
        self
    }

    /// Set start position for a newly created group
    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Enable or disable automatic acknowledgment
    pub fn with_auto_acknowledge(mut self, enabled: bool) -> Self {
        self.auto_acknowledge = enabled;
        self
    }

    /// Group name, falling back to the topic
    pub fn group_or(&self, topic: &TopicName) -> String {
        self.group.clone().unwrap_or_else(|| topic.to_string())
    }

    /// Consumer name, falling back to the topic
    pub fn name_or(&self, topic: &TopicName) -> String {
        self.name.clone().unwrap_or_else(|| topic.to_string())
    }
}

/// Backend side of a consumer: yields deliveries and settles them
#[async_trait]
pub trait MessageSource: Send {
    /// Backend name used in logs and errors
    fn backend(&self) -> &'static str;

    /// Called once at the start of each run, e.g. to ensure the group exists
    async fn prepare(&mut self) -> Result<(), MessagingError> {
        Ok(())
    }

    /// Wait for the next batch. An empty batch means the wait timed out.
    async fn receive(&mut self) -> Result<Vec<Delivery>, MessagingError>;

    /// Mark a delivery as processed
    async fn acknowledge(&mut self, delivery: &Delivery) -> Result<(), MessagingError>;

    /// Leave a delivery unacknowledged so it will be delivered again
    async fn abandon(&mut self, delivery: &Delivery) -> Result<(), MessagingError>;
}

/// Consumer implementing the stop protocol on top of a [`MessageSource`]
pub struct StandardConsumer<S: MessageSource> {
    topic: TopicName,
    source: S,
    auto_acknowledge: bool,
    state: ConsumerState,
}

impl<S: MessageSource> StandardConsumer<S> {
    /// Create new consumer over a backend source
    pub fn new(topic: TopicName, source: S, auto_acknowledge: bool) -> Self {
        Self {
            topic,
            source,
            auto_acknowledge,
            state: ConsumerState::Idle,
        }
    }

    /// Borrow the backend source
    pub fn source(&self) -> &S {
        &self.source
    }

    async fn drive(&mut self, handler: &dyn MessageHandler) -> Result<(), ConsumerError> {
        self.source.prepare().await?;

        loop {
            let deliveries = self.source.receive().await?;
            let mut remaining = deliveries.into_iter();

            while let Some(delivery) = remaining.next() {
                debug!(
                    topic = %self.topic,
                    receipt = %delivery.receipt,
                    delivery_count = delivery.delivery_count,
                    "Handling message"
                );

                match handler.handle(delivery.message.clone()).await {
                    Ok(HandlerOutcome::Continue) => {
                        if self.auto_acknowledge {
                            self.source.acknowledge(&delivery).await?;
                        }
                    }
                    Ok(HandlerOutcome::Stop { ack }) => {
                        self.state = ConsumerState::Stopping;
                        if ack {
                            self.source.acknowledge(&delivery).await?;
                        } else {
                            self.source.abandon(&delivery).await?;
                        }
                        self.release(remaining).await;
                        info!(topic = %self.topic, acked = ack, "Consumer stopped by handler");
                        return Ok(());
                    }
                    Err(error) => {
                        self.state = ConsumerState::Stopping;
                        self.release(std::iter::once(delivery).chain(remaining))
                            .await;
                        warn!(topic = %self.topic, error = %error, "Message handler failed");
                        return Err(ConsumerError::Handler(error));
                    }
                }
            }
        }
    }

    /// Hand back deliveries that were received but never handled
    async fn release(&mut self, deliveries: impl Iterator<Item = Delivery> + Send) {
        for delivery in deliveries {
            if let Err(e) = self.source.abandon(&delivery).await {
                warn!(
                    topic = %self.topic,
                    receipt = %delivery.receipt,
                    error = %e,
                    "Failed to abandon message; it will be redelivered once its lease expires"
                );
            }
        }
    }
}

#[async_trait]
impl<S: MessageSource> Consumer for StandardConsumer<S> {
    fn topic(&self) -> &TopicName {
        &self.topic
    }

    fn state(&self) -> ConsumerState {
        self.state
    }

    async fn run(&mut self, handler: &dyn MessageHandler) -> Result<(), ConsumerError> {
        self.state = ConsumerState::Running;
        info!(topic = %self.topic, backend = self.source.backend(), "Consumer running");

        let result = self.drive(handler).await;
        self.state = ConsumerState::Stopped;
        result
    }
}
