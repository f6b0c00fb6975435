//! Integration tests for configuration loading and backend resolution
//!
//! These tests verify:
//! - Unknown backend names fail resolution with the registered names listed
//! - Custom backends can be registered next to the built-in ones
//! - Settings files and environment overrides select the backends

use messaging_runtime::{
    BackendName, BackendRegistry, Broker, ConfigurationError, InMemoryBroker, MemorySettings,
    Messaging, MessagingSettings,
};
use serial_test::serial;
use std::sync::Arc;

fn settings(broker: &str, cache: &str) -> MessagingSettings {
    MessagingSettings {
        broker: broker.to_string(),
        cache: cache.to_string(),
        ..MessagingSettings::default()
    }
}

fn small_memory_broker(
    _settings: &MessagingSettings,
) -> Result<Arc<dyn Broker>, ConfigurationError> {
    Ok(Arc::new(InMemoryBroker::new(MemorySettings {
        max_topic_length: 1,
        ..MemorySettings::default()
    })))
}

/// Verify that an unknown broker name fails resolution
#[test]
fn test_unknown_broker_rejected() {
    let err = Messaging::from_settings(&settings("kafka", "memory")).unwrap_err();

    match err {
        ConfigurationError::UnknownBroker { name, registered } => {
            assert_eq!(name, "kafka");
            assert_eq!(registered, "memory, redis");
        }
        other => panic!("Expected UnknownBroker, got {:?}", other),
    }
}

/// Verify that an unknown cache name fails resolution
#[test]
fn test_unknown_cache_rejected() {
    let err = Messaging::from_settings(&settings("memory", "memcached")).unwrap_err();

    assert!(matches!(
        err,
        ConfigurationError::UnknownCache { ref name, .. } if name == "memcached"
    ));
}

/// Verify that malformed backend names are caught before lookup
#[test]
fn test_malformed_backend_name_rejected() {
    let err = Messaging::from_settings(&settings("Memory!", "memory")).unwrap_err();

    assert!(matches!(err, ConfigurationError::Invalid { .. }));
}

/// Verify that the Redis backends resolve without contacting a server
#[test]
fn test_redis_backends_resolve_lazily() {
    let messaging = Messaging::from_settings(&settings("redis", "redis")).unwrap();

    assert_eq!(messaging.broker().name(), "redis");
    assert_eq!(messaging.cache_backend().name(), "redis");
}

/// Verify that a custom backend can be registered and resolved by name
#[test]
fn test_custom_backend_registration() {
    let mut registry = BackendRegistry::with_builtin_backends();
    registry.register_broker(BackendName::new("small-memory").unwrap(), small_memory_broker);

    assert!(registry.contains_broker("small-memory"));
    assert!(!registry.contains_cache("small-memory"));

    let messaging = registry
        .resolve(&settings("small-memory", "memory"))
        .unwrap();
    assert_eq!(messaging.broker().name(), "memory");
}

/// Verify that a settings file selects the backends
#[test]
#[serial]
fn test_settings_file_selects_backends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messaging.yaml");
    std::fs::write(
        &path,
        "broker: redis\ncache: memory\ndeduplication_window_seconds: 30\nredis:\n  host: cache.internal\n  port: 6380\n",
    )
    .unwrap();

    let loaded = MessagingSettings::load(Some(&path)).unwrap();
    assert_eq!(loaded.broker, "redis");
    assert_eq!(loaded.redis.connection_url(), "redis://cache.internal:6380/0");

    let messaging = Messaging::from_settings(&loaded).unwrap();
    assert_eq!(messaging.broker().name(), "redis");
    assert_eq!(messaging.cache_backend().name(), "memory");
}

/// Verify that environment variables override the settings file
#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messaging.yaml");
    std::fs::write(&path, "broker: memory\ncache: memory\n").unwrap();

    std::env::set_var("MESSAGING__BROKER", "redis");
    let loaded = MessagingSettings::load(Some(&path));
    std::env::remove_var("MESSAGING__BROKER");

    assert_eq!(loaded.unwrap().broker, "redis");
}

/// Verify that invalid values in a settings file fail loading
#[test]
#[serial]
fn test_zero_window_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messaging.yaml");
    std::fs::write(&path, "deduplication_window_seconds: 0\n").unwrap();

    let err = MessagingSettings::load(Some(&path)).unwrap_err();

    assert!(matches!(err, ConfigurationError::Invalid { .. }));
}
