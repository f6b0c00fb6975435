//! Broker and cache backend implementations.
//!
//! Each backend supplies a [`Broker`](crate::Broker) and a
//! [`CacheBackend`](crate::CacheBackend); the registry decides which ones a
//! process uses.

pub mod memory;
pub mod redis;

pub use memory::{InMemoryBroker, InMemoryCache, InMemoryCacheStore};
pub use self::redis::{RedisBroker, RedisCache, RedisCacheBackend};
