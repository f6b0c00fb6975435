//! # Messaging Runtime
//!
//! Backend-agnostic publish/consume runtime with publisher-side deduplication.
//!
//! This library provides:
//! - Scoped publishers that drop recently seen messages by a caller-chosen
//!   attribute
//! - Long-running consumers with an explicit stop protocol and
//!   ack-after-success delivery
//! - Ephemeral subscriptions that are removed however their scope ends
//! - A registry resolving broker and cache backends by name from configuration
//! - In-memory and Redis Streams backends
//!
//! ## Module Organization
//!
//! - [error] - Error types for all messaging operations
//! - [message] - Messages, topics and receipts
//! - [cache] - Deduplication cache contract
//! - [publisher] - Publisher contract and the shared publishing pipeline
//! - [consumer] - Consumer contract and the stop protocol
//! - [broker] - Broker capability contract and fault injection
//! - [subscription] - Scoped ephemeral subscriptions
//! - [registry] - Backend resolution and the [`Messaging`] handle
//! - [settings] - Layered configuration
//! - [providers] - Concrete backends
//!
//! ## Example
//!
//! ```rust,no_run
//! use messaging_runtime::{HandlerOutcome, Message, Messaging, MessagingSettings, TopicName};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let messaging = Messaging::from_settings(&MessagingSettings::default())?;
//! let topic = TopicName::new("events".to_string())?;
//!
//! let mut publisher = messaging.create_publisher(&topic, None, Some("id"));
//! publisher.enter().await?;
//! publisher
//!     .publish_data("hello".into(), [("id".to_string(), "1".to_string())].into())
//!     .await?;
//! publisher.exit().await?;
//!
//! let mut consumer = messaging.create_consumer(&topic, Default::default());
//! consumer
//!     .run(&|message: Message| async move {
//!         println!("{:?}", message.data());
//!         Ok::<_, anyhow::Error>(HandlerOutcome::Stop { ack: true })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod broker;
pub mod cache;
pub mod consumer;
pub mod error;
pub mod message;
pub mod providers;
pub mod publisher;
pub mod registry;
pub mod settings;
pub mod subscription;

// Re-export commonly used types at crate root for convenience
pub use broker::{Broker, FaultSwitch, SubscriptionParams, TopicBreak};
pub use cache::{Cache, CacheBackend, DEFAULT_DEDUPLICATION_WINDOW};
pub use consumer::{
    Consumer, ConsumerOptions, ConsumerState, HandlerOutcome, MessageHandler, MessageSource,
    StandardConsumer, StartPosition,
};
pub use error::{
    ConfigurationError, ConsumerError, MessagingError, SerializationError, UsageError,
    ValidationError,
};
pub use message::{CapturedMessage, Delivery, Message, Receipt, TopicName};
pub use providers::{InMemoryBroker, InMemoryCache, InMemoryCacheStore, RedisBroker, RedisCacheBackend};
pub use publisher::{
    with_publisher, CaptureSink, CapturedMessages, CapturingPublisher, MessageSink, Publisher,
    ScopeState, StandardPublisher,
};
pub use registry::{BackendName, BackendRegistry, InvalidBackendNameError, Messaging};
pub use settings::{MemorySettings, MessagingSettings, RedisSettings};
pub use subscription::{with_ephemeral_subscription, EphemeralSubscription};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
