//! Common test utilities for messaging-runtime integration tests
//!
//! This module provides:
//! - In-memory `Messaging` handles with a direct handle on the broker
//! - Message and topic builders
//! - A handler that records what it received

use bytes::Bytes;
use messaging_runtime::{
    with_publisher, ConsumerOptions, HandlerOutcome, InMemoryBroker, InMemoryCacheStore, Message,
    MemorySettings, Messaging, MessagingError, TopicName,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(dead_code)]
pub const DEDUPLICATION_WINDOW: Duration = Duration::from_secs(60);

/// Topic with a unique suffix so tests never share state
#[allow(dead_code)]
pub fn unique_topic(prefix: &str) -> TopicName {
    TopicName::new(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())).unwrap()
}

/// In-memory messaging with the broker kept for inspection
#[allow(dead_code)]
pub fn memory_messaging() -> (Arc<InMemoryBroker>, Messaging) {
    memory_messaging_with(MemorySettings::default(), DEDUPLICATION_WINDOW)
}

#[allow(dead_code)]
pub fn memory_messaging_with(
    settings: MemorySettings,
    window: Duration,
) -> (Arc<InMemoryBroker>, Messaging) {
    let broker = Arc::new(InMemoryBroker::new(settings));
    let caches = Arc::new(InMemoryCacheStore::new(window));
    let messaging = Messaging::new(broker.clone(), caches);
    (broker, messaging)
}

/// Consumer options that poll quickly
#[allow(dead_code)]
pub fn fast_options() -> ConsumerOptions {
    ConsumerOptions::new().with_block(Duration::from_millis(20))
}

/// Attributes carrying an `id`
#[allow(dead_code)]
pub fn with_id(id: &str) -> HashMap<String, String> {
    HashMap::from([("id".to_string(), id.to_string())])
}

/// Publish one message per id inside a single publisher scope
#[allow(dead_code)]
pub async fn publish_ids(
    messaging: &Messaging,
    topic: &TopicName,
    deduplicate_by: Option<&str>,
    ids: &[&str],
) -> Result<(), MessagingError> {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let mut publisher = messaging.create_publisher(topic, None, deduplicate_by);

    with_publisher(publisher.as_mut(), |p| {
        Box::pin(async move {
            for id in ids {
                p.publish_data(Bytes::from(format!("payload-{}", id)), with_id(&id))
                    .await?;
            }
            Ok(())
        })
    })
    .await
}

/// Records the `id` attribute of every handled message and stops once
/// `stop_after` messages were seen
#[allow(dead_code)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<String>>>,
    stop_after: usize,
    ack: bool,
}

#[allow(dead_code)]
impl Recorder {
    pub fn stopping_after(stop_after: usize, ack: bool) -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            stop_after,
            ack,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn record(&self, message: &Message) -> HandlerOutcome {
        let mut seen = self.seen.lock().unwrap();
        seen.push(message.attribute("id").unwrap_or_default().to_string());

        if seen.len() >= self.stop_after {
            HandlerOutcome::Stop { ack: self.ack }
        } else {
            HandlerOutcome::Continue
        }
    }
}

/// Consume until `recorder` asks to stop
#[allow(dead_code)]
pub async fn consume_into(
    messaging: &Messaging,
    topic: &TopicName,
    options: ConsumerOptions,
    recorder: &Recorder,
) -> Result<(), messaging_runtime::ConsumerError> {
    let mut consumer = messaging.create_consumer(topic, options);
    consumer
        .run(&|message: Message| {
            let outcome = recorder.record(&message);
            async move { Ok::<_, anyhow::Error>(outcome) }
        })
        .await
}
