//! Deduplication cache contract.
//!
//! A [`Cache`] remembers, per topic, which deduplication fingerprints it has
//! recently let through. The fingerprint of a message is the value of one
//! caller-chosen attribute. Fingerprints are retained for a bounded window
//! ([`DEFAULT_DEDUPLICATION_WINDOW`] unless configured otherwise) and then
//! expire, after which a message with the same fingerprint is novel again.

use crate::error::{MessagingError, UsageError};
use crate::message::{Message, TopicName};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;

/// How long a fingerprint stays "recently seen" unless configured otherwise
pub const DEFAULT_DEDUPLICATION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Per-topic store of recently seen message fingerprints.
///
/// Implementations must keep each operation atomic per key when the same
/// cache is shared by many concurrent workers. Lookup failures are returned as
/// errors, never treated as "not a duplicate".
#[async_trait]
pub trait Cache: Send + Sync {
    /// Topic this cache deduplicates
    fn topic(&self) -> &TopicName;

    /// Keep only messages whose fingerprint has not been seen, marking the kept
    /// fingerprints as seen. Relative order of the kept messages is preserved.
    ///
    /// Fails with [`UsageError::MissingDeduplicationAttribute`] before marking
    /// anything if any message lacks `attribute`.
    async fn without_duplicates(
        &self,
        attribute: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, MessagingError>;

    /// Unmark the fingerprints of `messages` so they are novel again
    async fn forget_duplicates(
        &self,
        attribute: &str,
        messages: &[Message],
    ) -> Result<(), MessagingError>;

    /// Drop all seen-state for the topic
    async fn clear_recently_seen_messages(&self) -> Result<(), MessagingError>;
}

/// Factory for per-topic caches, resolved from configuration
pub trait CacheBackend: Send + Sync {
    /// Registered backend name
    fn name(&self) -> &'static str;

    /// Create (or attach to) the cache for `topic`
    fn create_cache(&self, topic: TopicName) -> Arc<dyn Cache>;
}

/// Extract the deduplication fingerprint of every message.
///
/// Either all messages carry the attribute or the call fails; callers rely on
/// this to validate a whole batch before touching any store.
pub fn fingerprints<'a>(
    attribute: &str,
    messages: &'a [Message],
) -> Result<Vec<&'a str>, UsageError> {
    messages
        .iter()
        .map(|m| {
            m.attribute(attribute)
                .ok_or_else(|| UsageError::MissingDeduplicationAttribute {
                    attribute: attribute.to_string(),
                })
        })
        .collect()
}

/// Store key for a fingerprint within a topic
pub fn seen_key(topic: &TopicName, fingerprint: &str) -> String {
    format!("message:{}:{}", topic, fingerprint)
}

/// Pattern matching every seen key of a topic
pub fn seen_key_pattern(topic: &TopicName) -> String {
    format!("message:{}:*", topic)
}
