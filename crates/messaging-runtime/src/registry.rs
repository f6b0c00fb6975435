//! Backend registry and the resolved [`Messaging`] handle.
//!
//! Backends are selected by name from configuration. [`BackendRegistry`]
//! associates names (e.g. `"memory"`, `"redis"`) with factory functions for
//! brokers and caches. The two kinds resolve independently, so a Redis cache
//! can sit in front of an in-memory broker and vice versa.
//!
//! Resolution happens once, at startup. An unknown name is a
//! [`ConfigurationError`] naming the backend and listing what is registered.

use crate::broker::{Broker, SubscriptionParams, TopicBreak};
use crate::cache::{Cache, CacheBackend};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::{ConfigurationError, MessagingError};
use crate::message::TopicName;
use crate::providers::{InMemoryBroker, InMemoryCacheStore, RedisBroker, RedisCacheBackend};
use crate::publisher::Publisher;
use crate::settings::MessagingSettings;
use crate::subscription::{with_ephemeral_subscription, EphemeralSubscription};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

// ============================================================================
// BackendName
// ============================================================================

/// Validated backend identifier.
///
/// A backend name consists of lowercase ASCII letters, digits, hyphens (`-`)
/// or underscores (`_`) and is never empty.
///
/// # Examples
///
/// ```rust
/// use messaging_runtime::BackendName;
///
/// assert_eq!(BackendName::new("redis").unwrap().as_str(), "redis");
/// assert!(BackendName::new("Redis").is_err());
/// assert!(BackendName::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendName(String);

impl BackendName {
    /// Create a new `BackendName`, validating its characters
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidBackendNameError> {
        let s = value.into();
        if s.is_empty() {
            return Err(InvalidBackendNameError::Empty);
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(InvalidBackendNameError::InvalidChars { value: s });
        }
        Ok(Self(s))
    }

    /// Return the backend name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a [`BackendName`] cannot be created
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBackendNameError {
    #[error("Backend name must not be empty")]
    Empty,

    #[error(
        "Backend name '{value}' contains invalid characters; \
         use lowercase alphanumeric, hyphens, or underscores"
    )]
    InvalidChars { value: String },
}

impl From<InvalidBackendNameError> for ConfigurationError {
    fn from(error: InvalidBackendNameError) -> Self {
        ConfigurationError::Invalid {
            message: error.to_string(),
        }
    }
}

// ============================================================================
// BackendRegistry
// ============================================================================

/// Builds a broker from settings
pub type BrokerFactory = fn(&MessagingSettings) -> Result<Arc<dyn Broker>, ConfigurationError>;

/// Builds a cache backend from settings
pub type CacheFactory = fn(&MessagingSettings) -> Result<Arc<dyn CacheBackend>, ConfigurationError>;

/// Registry mapping backend names to their factories.
///
/// Built once at startup. Registering a name twice replaces the earlier
/// factory.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    brokers: HashMap<String, BrokerFactory>,
    caches: HashMap<String, CacheFactory>,
}

impl BackendRegistry {
    /// Create a new, empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `memory` and `redis` backends of both kinds
    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::new();
        registry
            .register_broker(BackendName(String::from("memory")), memory_broker)
            .register_broker(BackendName(String::from("redis")), redis_broker)
            .register_cache(BackendName(String::from("memory")), memory_cache)
            .register_cache(BackendName(String::from("redis")), redis_cache);
        registry
    }

    /// Register a broker factory
    pub fn register_broker(&mut self, name: BackendName, factory: BrokerFactory) -> &mut Self {
        self.brokers.insert(name.0, factory);
        self
    }

    /// Register a cache factory
    pub fn register_cache(&mut self, name: BackendName, factory: CacheFactory) -> &mut Self {
        self.caches.insert(name.0, factory);
        self
    }

    /// Check whether a broker backend is registered
    pub fn contains_broker(&self, name: &str) -> bool {
        self.brokers.contains_key(name)
    }

    /// Check whether a cache backend is registered
    pub fn contains_cache(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Build the broker named in `settings`
    pub fn resolve_broker(
        &self,
        settings: &MessagingSettings,
    ) -> Result<Arc<dyn Broker>, ConfigurationError> {
        let factory = self.brokers.get(&settings.broker).ok_or_else(|| {
            ConfigurationError::UnknownBroker {
                name: settings.broker.clone(),
                registered: registered_names(&self.brokers),
            }
        })?;
        factory(settings)
    }

    /// Build the cache backend named in `settings`
    pub fn resolve_cache(
        &self,
        settings: &MessagingSettings,
    ) -> Result<Arc<dyn CacheBackend>, ConfigurationError> {
        let factory = self.caches.get(&settings.cache).ok_or_else(|| {
            ConfigurationError::UnknownCache {
                name: settings.cache.clone(),
                registered: registered_names(&self.caches),
            }
        })?;
        factory(settings)
    }

    /// Resolve both backends into a ready-to-use handle
    pub fn resolve(&self, settings: &MessagingSettings) -> Result<Messaging, ConfigurationError> {
        settings.validate()?;
        let broker = self.resolve_broker(settings)?;
        let caches = self.resolve_cache(settings)?;

        info!(broker = broker.name(), cache = caches.name(), "Resolved messaging backends");
        Ok(Messaging::new(broker, caches))
    }
}

fn registered_names<V>(map: &HashMap<String, V>) -> String {
    let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
    names.sort_unstable();
    names.join(", ")
}

fn memory_broker(settings: &MessagingSettings) -> Result<Arc<dyn Broker>, ConfigurationError> {
    Ok(Arc::new(InMemoryBroker::new(settings.memory.clone())))
}

fn redis_broker(settings: &MessagingSettings) -> Result<Arc<dyn Broker>, ConfigurationError> {
    Ok(Arc::new(RedisBroker::new(&settings.redis)?))
}

fn memory_cache(settings: &MessagingSettings) -> Result<Arc<dyn CacheBackend>, ConfigurationError> {
    Ok(Arc::new(InMemoryCacheStore::new(settings.deduplication_window())))
}

fn redis_cache(settings: &MessagingSettings) -> Result<Arc<dyn CacheBackend>, ConfigurationError> {
    Ok(Arc::new(RedisCacheBackend::new(
        &settings.redis,
        settings.deduplication_window(),
    )?))
}

// ============================================================================
// Messaging
// ============================================================================

/// Resolved broker and cache backends.
///
/// Cheap to clone; clones share the same backends.
#[derive(Clone)]
pub struct Messaging {
    broker: Arc<dyn Broker>,
    caches: Arc<dyn CacheBackend>,
}

impl Messaging {
    /// Combine an already built broker and cache backend
    pub fn new(broker: Arc<dyn Broker>, caches: Arc<dyn CacheBackend>) -> Self {
        Self { broker, caches }
    }

    /// Resolve the built-in backends named in `settings`
    pub fn from_settings(settings: &MessagingSettings) -> Result<Self, ConfigurationError> {
        BackendRegistry::with_builtin_backends().resolve(settings)
    }

    /// The resolved broker
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// The resolved cache backend
    pub fn cache_backend(&self) -> &Arc<dyn CacheBackend> {
        &self.caches
    }

    /// Create the dedup cache for `topic`
    pub fn create_cache(&self, topic: &TopicName) -> Arc<dyn Cache> {
        self.caches.create_cache(topic.clone())
    }

    /// Create a publisher for `topic`.
    ///
    /// Without an explicit cache, the configured backend's cache for `topic`
    /// is used. Deduplication only happens when `deduplicate_by` is given.
    pub fn create_publisher(
        &self,
        topic: &TopicName,
        cache: Option<Arc<dyn Cache>>,
        deduplicate_by: Option<&str>,
    ) -> Box<dyn Publisher> {
        let cache = cache.unwrap_or_else(|| self.create_cache(topic));
        self.broker
            .create_publisher(topic.clone(), cache, deduplicate_by.map(str::to_string))
    }

    /// Create a consumer for `topic`
    pub fn create_consumer(&self, topic: &TopicName, options: ConsumerOptions) -> Box<dyn Consumer> {
        self.broker.create_consumer(topic.clone(), options)
    }

    /// Open an ephemeral subscription guard on `topic`
    pub async fn ephemeral_subscription(
        &self,
        topic: &TopicName,
    ) -> Result<EphemeralSubscription, MessagingError> {
        EphemeralSubscription::open(Arc::clone(&self.broker), topic).await
    }

    /// Run `body` with an ephemeral subscription on `topic`, removing it
    /// afterwards
    pub async fn with_ephemeral_subscription<F, Fut, T, E>(
        &self,
        topic: &TopicName,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(SubscriptionParams) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MessagingError>,
    {
        with_ephemeral_subscription(Arc::clone(&self.broker), topic, body).await
    }

    /// Break publishing on the resolved broker until the guard drops
    pub fn break_topic(&self) -> TopicBreak {
        self.broker.break_topic()
    }
}

impl std::fmt::Debug for Messaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messaging")
            .field("broker", &self.broker.name())
            .field("cache", &self.caches.name())
            .finish()
    }
}
