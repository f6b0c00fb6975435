//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(MessagingError::transport("memory", "connection reset").is_transient());
    assert!(MessagingError::cache("redis", "timeout").is_transient());

    assert!(!MessagingError::from(UsageError::PublisherNotEntered).is_transient());
    assert!(!MessagingError::from(ValidationError::Required {
        field: "topic".to_string(),
    })
    .is_transient());
}

#[test]
fn test_usage_errors_are_flagged() {
    let err = MessagingError::from(UsageError::MissingDeduplicationAttribute {
        attribute: "id".to_string(),
    });
    assert!(err.is_usage_error());
    assert_eq!(
        err.to_string(),
        "Usage error: Message is missing deduplication attribute 'id'"
    );

    assert!(!MessagingError::transport("memory", "oops").is_usage_error());
}

#[test]
fn test_handler_error_preserves_original() {
    #[derive(Debug, thiserror::Error)]
    #[error("handler blew up")]
    struct Boom;

    let err = ConsumerError::Handler(anyhow::Error::new(Boom));
    let inner = err.handler_error().expect("handler error");
    assert!(inner.downcast_ref::<Boom>().is_some());

    let transport = ConsumerError::from(MessagingError::transport("memory", "oops"));
    assert!(transport.handler_error().is_none());
}

#[test]
fn test_configuration_error_lists_registered_backends() {
    let err = ConfigurationError::UnknownBroker {
        name: "whodis".to_string(),
        registered: "memory, redis".to_string(),
    };
    assert!(err.to_string().contains("whodis"));
    assert!(err.to_string().contains("memory, redis"));
}
