//! Broker capability contract.
//!
//! A broker backend is only usable when it supplies the whole set: publishers,
//! consumers, ephemeral subscriptions and the `break_topic` fault hook. The
//! [`Broker`] trait is that set, so conformance is checked by the compiler
//! rather than at each call site.

use crate::cache::Cache;
use crate::consumer::{Consumer, ConsumerOptions, StartPosition};
use crate::error::MessagingError;
use crate::message::TopicName;
use crate::publisher::Publisher;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

/// A message transport backend
#[async_trait]
pub trait Broker: Send + Sync {
    /// Registered backend name
    fn name(&self) -> &'static str;

    /// Create a publisher for `topic`; it must be entered before use
    fn create_publisher(
        &self,
        topic: TopicName,
        cache: Arc<dyn Cache>,
        deduplicate_by: Option<String>,
    ) -> Box<dyn Publisher>;

    /// Create a consumer for `topic`
    fn create_consumer(&self, topic: TopicName, options: ConsumerOptions) -> Box<dyn Consumer>;

    /// Create a temporary, uniquely named subscription on `topic`
    async fn create_ephemeral_subscription(
        &self,
        topic: &TopicName,
    ) -> Result<SubscriptionParams, MessagingError>;

    /// Remove a subscription created by
    /// [`create_ephemeral_subscription`](Broker::create_ephemeral_subscription).
    /// Removing one that no longer exists is not an error.
    async fn delete_ephemeral_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> Result<(), MessagingError>;

    /// Make every publish on this broker fail until the returned guard drops.
    /// Intended for exercising failure paths in tests.
    fn break_topic(&self) -> TopicBreak;
}

/// Everything a consumer needs to attach to an ephemeral subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub topic: TopicName,
    pub group: String,
    pub name: String,
}

impl SubscriptionParams {
    /// Consumer options attaching to this subscription
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions::new()
            .with_group(self.group.clone())
            .with_name(self.name.clone())
            .with_start_position(StartPosition::Latest)
    }
}

/// Generate a unique name for an ephemeral subscription
pub fn ephemeral_group_name() -> String {
    let host: String = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| "localhost".to_string())
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let host = if host.is_empty() { "localhost".to_string() } else { host };

    format!("ephemeral-{}-{}", host, uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Fault injection
// ============================================================================

/// Shared switch consulted by a broker's publishers before every send
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    breaks: Arc<AtomicUsize>,
}

impl FaultSwitch {
    /// Create new switch in the healthy position
    pub fn new() -> Self {
        Self::default()
    }

    /// Break publishing until the returned guard is dropped. Guards nest.
    pub fn trip(&self) -> TopicBreak {
        self.breaks.fetch_add(1, Ordering::SeqCst);
        TopicBreak {
            breaks: Arc::clone(&self.breaks),
        }
    }

    /// Check whether publishing is currently broken
    pub fn is_tripped(&self) -> bool {
        self.breaks.load(Ordering::SeqCst) > 0
    }

    /// Fail with a transport error if publishing is broken
    pub fn check(&self, backend: &str, topic: &TopicName) -> Result<(), MessagingError> {
        if self.is_tripped() {
            return Err(MessagingError::transport(
                backend,
                format!("oops: publishing to topic '{}' is broken", topic),
            ));
        }
        Ok(())
    }
}

/// Guard returned by [`Broker::break_topic`]; publishing recovers on drop
#[must_use = "publishing is only broken while the guard is alive"]
#[derive(Debug)]
pub struct TopicBreak {
    breaks: Arc<AtomicUsize>,
}

impl Drop for TopicBreak {
    fn drop(&mut self) {
        self.breaks.fetch_sub(1, Ordering::SeqCst);
    }
}
