//! In-memory broker and deduplication cache for testing and development.
//!
//! The broker models a stream per topic rather than a plain queue:
//! - Every topic keeps an append-only log, trimmed to `max_topic_length`
//! - Each subscription (group) keeps its own cursor into the log, so every
//!   group sees every message once
//! - Delivered messages are leased to the consumer; an unacknowledged message
//!   is handed out again when it is abandoned or its lease lapses
//!
//! State lives behind one `Arc<Mutex<_>>` shared by the broker and every
//! publisher and consumer it creates, so a single broker instance behaves like
//! one server. Separate instances share nothing.

use crate::broker::{ephemeral_group_name, Broker, FaultSwitch, SubscriptionParams, TopicBreak};
use crate::cache::{fingerprints, Cache, CacheBackend};
use crate::consumer::{
    Consumer, ConsumerOptions, MessageSource, StandardConsumer, StartPosition,
};
use crate::error::MessagingError;
use crate::message::{Delivery, Message, Receipt, TopicName};
use crate::publisher::{MessageSink, Publisher, StandardPublisher};
use crate::settings::MemorySettings;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const BACKEND: &str = "memory";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// All topics of one broker instance
struct BrokerState {
    topics: HashMap<TopicName, TopicLog>,
    settings: MemorySettings,
}

impl BrokerState {
    fn new(settings: MemorySettings) -> Self {
        Self {
            topics: HashMap::new(),
            settings,
        }
    }

    fn get_or_create_topic(&mut self, topic: &TopicName) -> &mut TopicLog {
        self.topics.entry(topic.clone()).or_default()
    }

    fn group_mut(&mut self, topic: &TopicName, group: &str) -> Result<&mut GroupState, MessagingError> {
        self.topics
            .get_mut(topic)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| {
                MessagingError::transport(
                    BACKEND,
                    format!("subscription '{}' does not exist on topic '{}'", group, topic),
                )
            })
    }
}

/// Retained messages and subscriptions of a single topic
#[derive(Default)]
struct TopicLog {
    entries: VecDeque<StoredMessage>,
    next_sequence: u64,
    groups: HashMap<String, GroupState>,
    notify: Arc<Notify>,
}

impl TopicLog {
    fn append(&mut self, message: Message, max_length: usize) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(StoredMessage { sequence, message });

        while self.entries.len() > max_length {
            self.entries.pop_front();
        }

        sequence
    }

    fn create_group(&mut self, group: &str, start: StartPosition) -> bool {
        if self.groups.contains_key(group) {
            return false;
        }

        let cursor = match start {
            StartPosition::Earliest => self.entries.front().map_or(self.next_sequence, |e| e.sequence),
            StartPosition::Latest => self.next_sequence,
        };
        self.groups.insert(group.to_string(), GroupState::new(cursor));
        true
    }
}

#[derive(Clone)]
struct StoredMessage {
    sequence: u64,
    message: Message,
}

/// Position and outstanding deliveries of one subscription
struct GroupState {
    /// Sequence of the next never-delivered message
    cursor: u64,
    /// Messages handed back, delivered again before new ones
    redeliveries: VecDeque<Pending>,
    /// Leased messages keyed by receipt
    in_flight: HashMap<String, InFlight>,
}

impl GroupState {
    fn new(cursor: u64) -> Self {
        Self {
            cursor,
            redeliveries: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Return lapsed leases to the redelivery queue
    fn expire_leases(&mut self, now: Instant, reclaim_idle: Option<Duration>) {
        let lapsed: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| {
                f.lease_expires_at <= now
                    || reclaim_idle.is_some_and(|idle| now.duration_since(f.delivered_at) >= idle)
            })
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in lapsed {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                trace!(receipt = %receipt, "Lease lapsed; message will be redelivered");
                self.redeliveries.push_back(flight.pending);
            }
        }
    }

    fn pending_count(&self) -> usize {
        self.redeliveries.len() + self.in_flight.len()
    }
}

/// A message owed to a group
#[derive(Clone)]
struct Pending {
    sequence: u64,
    message: Message,
    delivery_count: u32,
}

struct InFlight {
    pending: Pending,
    delivered_at: Instant,
    lease_expires_at: Instant,
}

fn receipt_for(pending: &Pending) -> String {
    format!("{}-{}", pending.sequence, pending.delivery_count)
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> Result<MutexGuard<'_, BrokerState>, MessagingError> {
    state
        .lock()
        .map_err(|_| MessagingError::transport(BACKEND, "broker state lock poisoned"))
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementation
pub struct InMemoryBroker {
    state: SharedState,
    faults: FaultSwitch,
}

impl InMemoryBroker {
    /// Create new in-memory broker with settings
    pub fn new(settings: MemorySettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(settings))),
            faults: FaultSwitch::new(),
        }
    }

    /// Number of messages currently retained for `topic`
    pub fn topic_len(&self, topic: &TopicName) -> Result<usize, MessagingError> {
        let state = lock(&self.state)?;
        Ok(state.topics.get(topic).map_or(0, |log| log.entries.len()))
    }

    /// Names of the subscriptions on `topic`, sorted
    pub fn subscription_names(&self, topic: &TopicName) -> Result<Vec<String>, MessagingError> {
        let state = lock(&self.state)?;
        let mut names: Vec<String> = state
            .topics
            .get(topic)
            .map(|log| log.groups.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    /// Messages delivered to `group` but not yet acknowledged
    pub fn pending_count(&self, topic: &TopicName, group: &str) -> Result<usize, MessagingError> {
        let state = lock(&self.state)?;
        Ok(state
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map_or(0, GroupState::pending_count))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(MemorySettings::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn create_publisher(
        &self,
        topic: TopicName,
        cache: Arc<dyn Cache>,
        deduplicate_by: Option<String>,
    ) -> Box<dyn Publisher> {
        let sink = MemorySink {
            state: Arc::clone(&self.state),
            faults: self.faults.clone(),
        };
        Box::new(StandardPublisher::new(topic, cache, deduplicate_by, sink))
    }

    fn create_consumer(&self, topic: TopicName, options: ConsumerOptions) -> Box<dyn Consumer> {
        let auto_acknowledge = options.auto_acknowledge;
        let source = MemorySource::new(Arc::clone(&self.state), topic.clone(), options);
        Box::new(StandardConsumer::new(topic, source, auto_acknowledge))
    }

    async fn create_ephemeral_subscription(
        &self,
        topic: &TopicName,
    ) -> Result<SubscriptionParams, MessagingError> {
        let group = ephemeral_group_name();
        let mut state = lock(&self.state)?;
        state
            .get_or_create_topic(topic)
            .create_group(&group, StartPosition::Latest);

        Ok(SubscriptionParams {
            topic: topic.clone(),
            name: group.clone(),
            group,
        })
    }

    async fn delete_ephemeral_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> Result<(), MessagingError> {
        let mut state = lock(&self.state)?;
        if let Some(log) = state.topics.get_mut(&params.topic) {
            if log.groups.remove(&params.group).is_none() {
                debug!(group = %params.group, "Ephemeral subscription already removed");
            }
        }
        Ok(())
    }

    fn break_topic(&self) -> TopicBreak {
        self.faults.trip()
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// Appends messages to the shared topic log
pub struct MemorySink {
    state: SharedState,
    faults: FaultSwitch,
}

#[async_trait]
impl MessageSink for MemorySink {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn send(&mut self, topic: &TopicName, message: &Message) -> Result<(), MessagingError> {
        self.faults.check(BACKEND, topic)?;

        let mut state = lock(&self.state)?;
        let max_length = state.settings.max_topic_length;
        let log = state.get_or_create_topic(topic);
        let sequence = log.append(message.clone(), max_length);
        log.notify.notify_waiters();

        trace!(topic = %topic, sequence, "Appended message");
        Ok(())
    }
}

// ============================================================================
// Consuming
// ============================================================================

/// Reads one subscription of a topic log
pub struct MemorySource {
    state: SharedState,
    topic: TopicName,
    group: String,
    name: String,
    options: ConsumerOptions,
    notify: Option<Arc<Notify>>,
}

impl MemorySource {
    fn new(state: SharedState, topic: TopicName, options: ConsumerOptions) -> Self {
        Self {
            group: options.group_or(&topic),
            name: options.name_or(&topic),
            state,
            topic,
            options,
            notify: None,
        }
    }

    /// Subscription this source reads
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Consumer name within the subscription
    pub fn name(&self) -> &str {
        &self.name
    }

    fn take_batch(&self) -> Result<Vec<Delivery>, MessagingError> {
        let mut state = lock(&self.state)?;
        let lease = state.settings.redelivery_timeout();
        let log = state.topics.get_mut(&self.topic).ok_or_else(|| {
            MessagingError::transport(BACKEND, format!("topic '{}' does not exist", self.topic))
        })?;
        let entries = &log.entries;
        let group = log.groups.get_mut(&self.group).ok_or_else(|| {
            MessagingError::transport(
                BACKEND,
                format!("subscription '{}' does not exist on topic '{}'", self.group, self.topic),
            )
        })?;

        let now = Instant::now();
        let reclaim_idle = self
            .options
            .process_pending_messages
            .then_some(self.options.min_idle_time);
        group.expire_leases(now, reclaim_idle);

        let mut batch = Vec::new();
        while batch.len() < self.options.batch_size {
            let Some(mut pending) = group.redeliveries.pop_front() else {
                break;
            };
            pending.delivery_count += 1;
            batch.push(pending);
        }

        let oldest = entries.front().map_or(group.cursor, |e| e.sequence);
        if group.cursor < oldest {
            warn!(
                topic = %self.topic,
                group = %self.group,
                skipped = oldest - group.cursor,
                "Messages trimmed before this subscription received them"
            );
            group.cursor = oldest;
        }

        let start = group.cursor;
        for entry in entries.iter().filter(|e| e.sequence >= start) {
            if batch.len() >= self.options.batch_size {
                break;
            }
            group.cursor = entry.sequence + 1;
            batch.push(Pending {
                sequence: entry.sequence,
                message: entry.message.clone(),
                delivery_count: 1,
            });
        }

        Ok(batch
            .into_iter()
            .map(|pending| {
                let receipt = receipt_for(&pending);
                let delivery = Delivery {
                    message: pending.message.clone(),
                    receipt: Receipt::new(receipt.clone()),
                    delivery_count: pending.delivery_count,
                };
                group.in_flight.insert(
                    receipt,
                    InFlight {
                        pending,
                        delivered_at: now,
                        lease_expires_at: now + lease,
                    },
                );
                delivery
            })
            .collect())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn prepare(&mut self) -> Result<(), MessagingError> {
        let mut state = lock(&self.state)?;
        let log = state.get_or_create_topic(&self.topic);
        if log.create_group(&self.group, self.options.start_position) {
            debug!(topic = %self.topic, group = %self.group, "Created subscription");
        }
        self.notify = Some(Arc::clone(&log.notify));
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<Delivery>, MessagingError> {
        let deadline = tokio::time::Instant::now() + self.options.block;
        let notify = match &self.notify {
            Some(notify) => Arc::clone(notify),
            None => {
                self.prepare().await?;
                self.notify.clone().unwrap_or_default()
            }
        };

        loop {
            // Register interest before looking so a publish in between is not missed
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch()?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&mut self, delivery: &Delivery) -> Result<(), MessagingError> {
        let mut state = lock(&self.state)?;
        let group = state.group_mut(&self.topic, &self.group)?;
        if group.in_flight.remove(delivery.receipt.as_str()).is_none() {
            debug!(receipt = %delivery.receipt, "Acknowledged unknown or expired receipt");
        }
        Ok(())
    }

    async fn abandon(&mut self, delivery: &Delivery) -> Result<(), MessagingError> {
        let notify = {
            let mut state = lock(&self.state)?;
            let group = state.group_mut(&self.topic, &self.group)?;
            match group.in_flight.remove(delivery.receipt.as_str()) {
                Some(flight) => group.redeliveries.push_front(flight.pending),
                None => {
                    debug!(receipt = %delivery.receipt, "Abandoned unknown or expired receipt");
                    return Ok(());
                }
            }
            state.topics.get(&self.topic).map(|log| Arc::clone(&log.notify))
        };

        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        Ok(())
    }
}

// ============================================================================
// Deduplication cache
// ============================================================================

/// Seen fingerprints and the instant each stops counting
type SeenSet = Arc<Mutex<HashMap<String, Instant>>>;

/// Cache backend handing out per-topic in-memory caches.
///
/// Caches created for the same topic share their seen-state.
pub struct InMemoryCacheStore {
    window: Duration,
    topics: Mutex<HashMap<TopicName, SeenSet>>,
}

impl InMemoryCacheStore {
    /// Create new store retaining fingerprints for `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl CacheBackend for InMemoryCacheStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn create_cache(&self, topic: TopicName) -> Arc<dyn Cache> {
        let seen = {
            // The map is insert-only, so a poisoned lock still holds valid data
            let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(topics.entry(topic.clone()).or_default())
        };

        Arc::new(InMemoryCache {
            topic,
            window: self.window,
            seen,
        })
    }
}

/// Per-topic in-memory deduplication cache
pub struct InMemoryCache {
    topic: TopicName,
    window: Duration,
    seen: SeenSet,
}

impl InMemoryCache {
    /// Create a standalone cache for `topic`
    pub fn new(topic: TopicName, window: Duration) -> Self {
        Self {
            topic,
            window,
            seen: SeenSet::default(),
        }
    }

    fn lock_seen(&self) -> Result<MutexGuard<'_, HashMap<String, Instant>>, MessagingError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| MessagingError::cache(BACKEND, "seen-set lock poisoned"))?;
        let now = Instant::now();
        seen.retain(|_, expires_at| *expires_at > now);
        Ok(seen)
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    fn topic(&self) -> &TopicName {
        &self.topic
    }

    async fn without_duplicates(
        &self,
        attribute: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, MessagingError> {
        let keys: Vec<String> = fingerprints(attribute, &messages)?
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut seen = self.lock_seen()?;
        let expires_at = Instant::now() + self.window;

        Ok(messages
            .into_iter()
            .zip(keys)
            .filter_map(|(message, key)| {
                if seen.contains_key(&key) {
                    trace!(topic = %self.topic, fingerprint = %key, "Duplicate fingerprint");
                    return None;
                }
                seen.insert(key, expires_at);
                Some(message)
            })
            .collect())
    }

    async fn forget_duplicates(
        &self,
        attribute: &str,
        messages: &[Message],
    ) -> Result<(), MessagingError> {
        let keys = fingerprints(attribute, messages)?;
        let mut seen = self.lock_seen()?;
        for key in keys {
            seen.remove(key);
        }
        Ok(())
    }

    async fn clear_recently_seen_messages(&self) -> Result<(), MessagingError> {
        self.lock_seen()?.clear();
        Ok(())
    }
}
