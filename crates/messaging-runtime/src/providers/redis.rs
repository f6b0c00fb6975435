//! Redis Streams broker and Redis-backed deduplication cache.
//!
//! Mapping onto Redis:
//! - A topic is a stream key; a message is one entry with a `data` field
//!   holding the payload and an `attributes` field holding a JSON object
//! - A subscription is a consumer group; consumers read with `XREADGROUP`
//!   and settle with `XACK`
//! - Unacknowledged entries stay in the group's pending list until another
//!   consumer reclaims them with `XAUTOCLAIM`
//! - Dedup fingerprints are plain keys `message:{topic}:{fingerprint}`
//!   written with `SET NX EX`, so concurrent workers agree on first sightings
//!
//! Publishers and caches share one lazily created [`ConnectionManager`].
//! Consumers block inside `XREADGROUP` and therefore get a connection each.

use crate::broker::{ephemeral_group_name, Broker, FaultSwitch, SubscriptionParams, TopicBreak};
use crate::cache::{fingerprints, seen_key, seen_key_pattern, Cache, CacheBackend};
use crate::consumer::{
    Consumer, ConsumerOptions, MessageSource, StandardConsumer, StartPosition,
};
use crate::error::{ConfigurationError, MessagingError, SerializationError};
use crate::message::{Delivery, Message, Receipt, TopicName};
use crate::publisher::{MessageSink, Publisher, StandardPublisher};
use crate::settings::RedisSettings;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

#[cfg(test)]
#[path = "redis_tests.rs"]
mod tests;

const BACKEND: &str = "redis";

/// Stream entry field holding the payload
pub const DATA_FIELD: &str = "data";

/// Stream entry field holding the JSON-encoded attributes
pub const ATTRIBUTES_FIELD: &str = "attributes";

const SCAN_BATCH: usize = 100;

// ============================================================================
// Connection
// ============================================================================

/// Client plus a connection manager created on first use
#[derive(Clone)]
struct RedisConnection {
    client: redis::Client,
    shared: Arc<OnceCell<ConnectionManager>>,
}

impl RedisConnection {
    fn open(settings: &RedisSettings) -> Result<Self, ConfigurationError> {
        let client = redis::Client::open(settings.connection_url()).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("invalid redis connection settings: {}", e),
            }
        })?;

        Ok(Self {
            client,
            shared: Arc::new(OnceCell::new()),
        })
    }

    /// Shared multiplexed connection
    async fn shared(&self) -> Result<ConnectionManager, MessagingError> {
        let manager = self
            .shared
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    /// Connection owned by a single caller, for blocking commands
    async fn dedicated(&self) -> Result<ConnectionManager, MessagingError> {
        Ok(ConnectionManager::new(self.client.clone()).await?)
    }
}

// ============================================================================
// Entry encoding
// ============================================================================

/// Serialize attributes for the `attributes` field
pub fn encode_attributes(attributes: &HashMap<String, String>) -> Result<String, SerializationError> {
    Ok(serde_json::to_string(attributes)?)
}

/// Rebuild a message from a stream entry
pub fn decode_entry(entry: &StreamId) -> Result<Message, SerializationError> {
    let missing = |field: &str| SerializationError::MissingField {
        entry_id: entry.id.clone(),
        field: field.to_string(),
    };

    let data: Vec<u8> = entry.get(DATA_FIELD).ok_or_else(|| missing(DATA_FIELD))?;
    let attributes: HashMap<String, String> = match entry.get::<String>(ATTRIBUTES_FIELD) {
        Some(json) => serde_json::from_str(&json)?,
        None => return Err(missing(ATTRIBUTES_FIELD)),
    };

    Ok(Message::new(data, attributes))
}

fn is_busy_group(error: &redis::RedisError) -> bool {
    error.code() == Some("BUSYGROUP")
}

fn is_missing_key(error: &redis::RedisError) -> bool {
    error.to_string().contains("requires the key to exist")
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
fn millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Whole milliseconds in `duration`, saturating at `usize::MAX`
fn millis_usize(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}

// ============================================================================
// RedisBroker
// ============================================================================

/// Redis Streams broker
pub struct RedisBroker {
    connection: RedisConnection,
    faults: FaultSwitch,
}

impl RedisBroker {
    /// Create new broker; no connection is made until first use
    pub fn new(settings: &RedisSettings) -> Result<Self, ConfigurationError> {
        Ok(Self {
            connection: RedisConnection::open(settings)?,
            faults: FaultSwitch::new(),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn create_publisher(
        &self,
        topic: TopicName,
        cache: Arc<dyn Cache>,
        deduplicate_by: Option<String>,
    ) -> Box<dyn Publisher> {
        let sink = RedisSink {
            connection: self.connection.clone(),
            faults: self.faults.clone(),
            conn: None,
        };
        Box::new(StandardPublisher::new(topic, cache, deduplicate_by, sink))
    }

    fn create_consumer(&self, topic: TopicName, options: ConsumerOptions) -> Box<dyn Consumer> {
        let auto_acknowledge = options.auto_acknowledge;
        let source = RedisSource::new(self.connection.clone(), topic.clone(), options);
        Box::new(StandardConsumer::new(topic, source, auto_acknowledge))
    }

    async fn create_ephemeral_subscription(
        &self,
        topic: &TopicName,
    ) -> Result<SubscriptionParams, MessagingError> {
        let group = ephemeral_group_name();
        let mut conn = self.connection.shared().await?;
        create_group(&mut conn, topic, &group, StartPosition::Latest).await?;

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
        let mut conn = self.connection.shared().await?;
        let result = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(params.topic.as_str())
            .arg(&params.group)
            .query_async::<_, i64>(&mut conn)
            .await;

        match result {
            Ok(0) => debug!(group = %params.group, "Ephemeral subscription already removed"),
            Ok(_) => {}
            Err(e) if is_missing_key(&e) => {
                debug!(topic = %params.topic, "Stream already removed");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn break_topic(&self) -> TopicBreak {
        self.faults.trip()
    }
}

/// Create a consumer group, treating "already exists" as success
async fn create_group(
    conn: &mut ConnectionManager,
    topic: &TopicName,
    group: &str,
    start: StartPosition,
) -> Result<(), MessagingError> {
    let start_id = match start {
        StartPosition::Earliest => "0",
        StartPosition::Latest => "$",
    };

    let result = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(topic.as_str())
        .arg(group)
        .arg(start_id)
        .arg("MKSTREAM")
        .query_async::<_, ()>(conn)
        .await;

    match result {
        Ok(()) => {
            debug!(topic = %topic, group = %group, "Created consumer group");
            Ok(())
        }
        Err(e) if is_busy_group(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// Appends entries with `XADD`
pub struct RedisSink {
    connection: RedisConnection,
    faults: FaultSwitch,
    conn: Option<ConnectionManager>,
}

#[async_trait]
impl MessageSink for RedisSink {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn open(&mut self) -> Result<(), MessagingError> {
        self.conn = Some(self.connection.shared().await?);
        Ok(())
    }

    async fn send(&mut self, topic: &TopicName, message: &Message) -> Result<(), MessagingError> {
        self.faults.check(BACKEND, topic)?;

        let attributes = encode_attributes(message.attributes())?;
        let mut conn = match &self.conn {
            Some(conn) => conn.clone(),
            None => self.connection.shared().await?,
        };

        let entry_id: String = conn
            .xadd(
                topic.as_str(),
                "*",
                &[
                    (DATA_FIELD, message.data().as_ref()),
                    (ATTRIBUTES_FIELD, attributes.as_bytes()),
                ],
            )
            .await?;

        trace!(topic = %topic, entry_id = %entry_id, "Appended stream entry");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MessagingError> {
        self.conn = None;
        Ok(())
    }
}

// ============================================================================
// Consuming
// ============================================================================

/// Reads one consumer group of a stream
pub struct RedisSource {
    connection: RedisConnection,
    topic: TopicName,
    group: String,
    name: String,
    options: ConsumerOptions,
    conn: Option<ConnectionManager>,
}

impl RedisSource {
    fn new(connection: RedisConnection, topic: TopicName, options: ConsumerOptions) -> Self {
        Self {
            group: options.group_or(&topic),
            name: options.name_or(&topic),
            connection,
            topic,
            options,
            conn: None,
        }
    }

    async fn conn(&mut self) -> Result<&mut ConnectionManager, MessagingError> {
        if self.conn.is_none() {
            self.conn = Some(self.connection.dedicated().await?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| MessagingError::transport(BACKEND, "consumer connection unavailable"))
    }

    /// Claim entries other consumers left pending for too long
    async fn reclaim(&mut self) -> Result<Vec<StreamId>, MessagingError> {
        let topic = self.topic.clone();
        let group = self.group.clone();
        let name = self.name.clone();
        let min_idle_ms = millis_u64(self.options.min_idle_time);
        let count = self.options.batch_size;

        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(topic.as_str())
            .arg(&group)
            .arg(&name)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(self.conn().await?)
            .await?;

        match reply.get(1) {
            Some(entries) => Ok(redis::from_redis_value::<StreamRangeReply>(entries)?.ids),
            None => Ok(Vec::new()),
        }
    }

    /// Read never-delivered entries, blocking up to the configured time
    async fn read_new(&mut self) -> Result<Vec<StreamId>, MessagingError> {
        let block_ms = millis_usize(self.options.block).max(1);
        let options = StreamReadOptions::default()
            .group(&self.group, &self.name)
            .count(self.options.batch_size)
            .block(block_ms);
        let topic = self.topic.clone();

        let reply: Option<StreamReadReply> = self
            .conn()
            .await?
            .xread_options(&[topic.as_str()], &[">"], &options)
            .await?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    async fn to_deliveries(
        &mut self,
        entries: Vec<StreamId>,
        delivery_count: u32,
    ) -> Result<Vec<Delivery>, MessagingError> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry(&entry) {
                Ok(message) => deliveries.push(Delivery {
                    message,
                    receipt: Receipt::new(entry.id),
                    delivery_count,
                }),
                Err(e) => {
                    // Undecodable entries would be reclaimed forever; settle them
                    warn!(topic = %self.topic, entry_id = %entry.id, error = %e, "Dropping malformed stream entry");
                    self.ack_id(&entry.id).await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack_id(&mut self, id: &str) -> Result<(), MessagingError> {
        let topic = self.topic.clone();
        let group = self.group.clone();
        let _: i64 = self
            .conn()
            .await?
            .xack(topic.as_str(), &group, &[id])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageSource for RedisSource {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn prepare(&mut self) -> Result<(), MessagingError> {
        let topic = self.topic.clone();
        let group = self.group.clone();
        let start = self.options.start_position;
        create_group(self.conn().await?, &topic, &group, start).await
    }

    async fn receive(&mut self) -> Result<Vec<Delivery>, MessagingError> {
        if self.options.process_pending_messages {
            let reclaimed = self.reclaim().await?;
            if !reclaimed.is_empty() {
                debug!(topic = %self.topic, count = reclaimed.len(), "Reclaimed pending entries");
                return self.to_deliveries(reclaimed, 2).await;
            }
        }

        let entries = self.read_new().await?;
        self.to_deliveries(entries, 1).await
    }

    async fn acknowledge(&mut self, delivery: &Delivery) -> Result<(), MessagingError> {
        self.ack_id(delivery.receipt.as_str()).await
    }

    async fn abandon(&mut self, delivery: &Delivery) -> Result<(), MessagingError> {
        // Left in the pending list; another consumer reclaims it once idle
        trace!(topic = %self.topic, receipt = %delivery.receipt, "Leaving entry pending");
        Ok(())
    }
}

// ============================================================================
// Deduplication cache
// ============================================================================

/// Cache backend handing out Redis-backed per-topic caches
pub struct RedisCacheBackend {
    connection: RedisConnection,
    window: Duration,
}

impl RedisCacheBackend {
    /// Create new backend; no connection is made until first use
    pub fn new(settings: &RedisSettings, window: Duration) -> Result<Self, ConfigurationError> {
        Ok(Self {
            connection: RedisConnection::open(settings)?,
            window,
        })
    }
}

impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn create_cache(&self, topic: TopicName) -> Arc<dyn Cache> {
        Arc::new(RedisCache {
            topic,
            window: self.window,
            connection: self.connection.clone(),
        })
    }
}

/// Per-topic Redis deduplication cache
pub struct RedisCache {
    topic: TopicName,
    window: Duration,
    connection: RedisConnection,
}

impl RedisCache {
    fn window_seconds(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

#[async_trait]
impl Cache for RedisCache {
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
            .map(|fp| seen_key(&self.topic, fp))
            .collect();
        if keys.is_empty() {
            return Ok(messages);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &keys {
            pipe.cmd("SET")
                .arg(key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(self.window_seconds());
        }

        let mut conn = self.connection.shared().await?;
        let results: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        Ok(messages
            .into_iter()
            .zip(results)
            .filter_map(|(message, result)| match result {
                redis::Value::Nil => None,
                _ => Some(message),
            })
            .collect())
    }

    async fn forget_duplicates(
        &self,
        attribute: &str,
        messages: &[Message],
    ) -> Result<(), MessagingError> {
        let keys: Vec<String> = fingerprints(attribute, messages)?
            .into_iter()
            .map(|fp| seen_key(&self.topic, fp))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.shared().await?;
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn clear_recently_seen_messages(&self) -> Result<(), MessagingError> {
        let pattern = seen_key_pattern(&self.topic);
        let mut conn = self.connection.shared().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += keys.len();
                conn.del::<_, ()>(keys).await?;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        debug!(topic = %self.topic, deleted, "Cleared recently seen messages");
        Ok(())
    }
}
