//! Publisher contract and the shared publishing pipeline.
//!
//! Backends only provide a [`MessageSink`]; [`StandardPublisher`] wraps it
//! with scope tracking and deduplication so every backend behaves the same.

use crate::cache::Cache;
use crate::error::{MessagingError, UsageError};
use crate::message::{CapturedMessage, Message, TopicName};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;

/// Scoped resource that sends messages to a single topic.
///
/// A publisher is only usable between [`enter`](Publisher::enter) and
/// [`exit`](Publisher::exit). It may be entered again after exiting. A
/// publisher is not meant to be shared between concurrent callers.
#[async_trait]
pub trait Publisher: Send {
    /// Topic this publisher sends to
    fn topic(&self) -> &TopicName;

    /// Acquire the backend connection and open the scope
    async fn enter(&mut self) -> Result<(), MessagingError>;

    /// Close the scope and release the backend connection
    async fn exit(&mut self) -> Result<(), MessagingError>;

    /// Publish one message, dropping it silently if it is a known duplicate
    async fn publish_data(
        &mut self,
        data: Bytes,
        attributes: HashMap<String, String>,
    ) -> Result<(), MessagingError>;
}

/// Backend side of a publisher: delivers already-deduplicated messages
#[async_trait]
pub trait MessageSink: Send {
    /// Backend name used in logs and errors
    fn backend(&self) -> &'static str;

    async fn open(&mut self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn send(&mut self, topic: &TopicName, message: &Message) -> Result<(), MessagingError>;

    async fn close(&mut self) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// Lifecycle of a publisher scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Never entered
    Idle,
    /// Between enter and exit
    Open,
    /// Exited; may be entered again
    Closed,
}

impl ScopeState {
    /// Fail unless the scope is open
    pub fn ensure_open(&self) -> Result<(), UsageError> {
        match self {
            Self::Open => Ok(()),
            Self::Idle => Err(UsageError::PublisherNotEntered),
            Self::Closed => Err(UsageError::PublisherClosed),
        }
    }
}

/// Publisher that deduplicates through a [`Cache`] and delivers to a sink
pub struct StandardPublisher<S: MessageSink> {
    topic: TopicName,
    cache: Arc<dyn Cache>,
    deduplicate_by: Option<String>,
    sink: S,
    state: ScopeState,
}

impl<S: MessageSink> StandardPublisher<S> {
    /// Create new publisher; it must be entered before use
    pub fn new(
        topic: TopicName,
        cache: Arc<dyn Cache>,
        deduplicate_by: Option<String>,
        sink: S,
    ) -> Self {
        Self {
            topic,
            cache,
            deduplicate_by,
            sink,
            state: ScopeState::Idle,
        }
    }

    /// Current scope state
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Attribute used as deduplication key, if any
    pub fn deduplicate_by(&self) -> Option<&str> {
        self.deduplicate_by.as_deref()
    }

    /// Borrow the backend sink
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[async_trait]
impl<S: MessageSink> Publisher for StandardPublisher<S> {
    fn topic(&self) -> &TopicName {
        &self.topic
    }

    async fn enter(&mut self) -> Result<(), MessagingError> {
        if self.state == ScopeState::Open {
            return Err(UsageError::PublisherAlreadyEntered.into());
        }

        self.sink.open().await?;
        self.state = ScopeState::Open;
        debug!(topic = %self.topic, backend = self.sink.backend(), "Publisher entered");
        Ok(())
    }

    async fn exit(&mut self) -> Result<(), MessagingError> {
        if self.state != ScopeState::Open {
            return Ok(());
        }

        self.state = ScopeState::Closed;
        debug!(topic = %self.topic, backend = self.sink.backend(), "Publisher exited");
        self.sink.close().await
    }

    async fn publish_data(
        &mut self,
        data: Bytes,
        attributes: HashMap<String, String>,
    ) -> Result<(), MessagingError> {
        self.state.ensure_open()?;

        let batch = vec![Message::new(data, attributes)];
        let to_publish = match &self.deduplicate_by {
            Some(attribute) => self.cache.without_duplicates(attribute, batch).await?,
            None => batch,
        };

        if to_publish.is_empty() {
            debug!(
                topic = %self.topic,
                attribute = self.deduplicate_by.as_deref().unwrap_or_default(),
                "Dropping duplicate message"
            );
            return Ok(());
        }

        for message in &to_publish {
            if let Err(send_error) = self.sink.send(&self.topic, message).await {
                // The message never left, so it must not mask a retry as a duplicate.
                if let Some(attribute) = &self.deduplicate_by {
                    if let Err(forget_error) =
                        self.cache.forget_duplicates(attribute, &to_publish).await
                    {
                        warn!(
                            topic = %self.topic,
                            error = %forget_error,
                            "Failed to forget deduplication keys after publish failure"
                        );
                    }
                }
                return Err(send_error);
            }
        }

        Ok(())
    }
}

/// Run `body` inside an entered publisher scope, always exiting afterwards.
///
/// The body's error wins over an error raised while exiting.
pub async fn with_publisher<P, T, F>(publisher: &mut P, body: F) -> Result<T, MessagingError>
where
    P: Publisher + ?Sized,
    F: for<'a> FnOnce(
        &'a mut P,
    ) -> Pin<Box<dyn Future<Output = Result<T, MessagingError>> + Send + 'a>>,
{
    publisher.enter().await?;
    let result = body(&mut *publisher).await;
    let exited = publisher.exit().await;

    match (result, exited) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(exit_error)) => Err(exit_error),
        (Err(body_error), Ok(())) => Err(body_error),
        (Err(body_error), Err(exit_error)) => {
            warn!(error = %exit_error, "Publisher exit failed after body error");
            Err(body_error)
        }
    }
}

// ============================================================================
// Capturing publisher
// ============================================================================

/// Shared, explicitly owned collection a [`CaptureSink`] records into
pub type CapturedMessages = Arc<Mutex<Vec<CapturedMessage>>>;

/// Sink that records messages instead of sending them anywhere
pub struct CaptureSink {
    messages: CapturedMessages,
}

impl CaptureSink {
    /// Create a sink recording into `messages`
    pub fn new(messages: CapturedMessages) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl MessageSink for CaptureSink {
    fn backend(&self) -> &'static str {
        "capture"
    }

    async fn send(&mut self, _topic: &TopicName, message: &Message) -> Result<(), MessagingError> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| MessagingError::transport("capture", "capture sink lock poisoned"))?;
        messages.push(CapturedMessage::from(message.clone()));
        Ok(())
    }
}

/// Reference publisher recording into an injected per-instance sink
pub type CapturingPublisher = StandardPublisher<CaptureSink>;

impl CapturingPublisher {
    /// Create a capturing publisher; returns the publisher and its record
    pub fn capturing(
        topic: TopicName,
        cache: Arc<dyn Cache>,
        deduplicate_by: Option<String>,
    ) -> (Self, CapturedMessages) {
        let messages = CapturedMessages::default();
        let sink = CaptureSink::new(Arc::clone(&messages));
        (Self::new(topic, cache, deduplicate_by, sink), messages)
    }
}
