//! Integration tests for publisher-side deduplication
//!
//! These tests verify:
//! - Repeats of a fingerprint inside the retention window are dropped
//! - Fingerprints expire after the window
//! - A failed send does not poison the cache
//! - Concurrent publishers let exactly one copy through

mod common;

use common::*;
use messaging_runtime::{MemorySettings, MessagingError, UsageError};
use std::time::Duration;

/// Verify that repeats are dropped while new ids pass
#[tokio::test]
async fn test_repeated_ids_published_once() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    publish_ids(&messaging, &topic, Some("id"), &["1", "2", "1", "3", "2"])
        .await
        .unwrap();

    assert_eq!(broker.topic_len(&topic).unwrap(), 3);

    let recorder = Recorder::stopping_after(3, true);
    consume_into(&messaging, &topic, fast_options(), &recorder)
        .await
        .unwrap();
    assert_eq!(recorder.ids(), vec!["1", "2", "3"]);
}

/// Verify that separate publisher scopes share the topic cache
#[tokio::test]
async fn test_repeats_dropped_across_publishers() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    publish_ids(&messaging, &topic, Some("id"), &["1"]).await.unwrap();
    publish_ids(&messaging, &topic, Some("id"), &["1", "2"]).await.unwrap();

    assert_eq!(broker.topic_len(&topic).unwrap(), 2);
}

/// Verify that without a dedup attribute nothing is dropped
#[tokio::test]
async fn test_no_deduplication_without_attribute() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    publish_ids(&messaging, &topic, None, &["1", "1"]).await.unwrap();

    assert_eq!(broker.topic_len(&topic).unwrap(), 2);
}

/// Verify that a message without the dedup attribute is rejected and marks
/// nothing
#[tokio::test]
async fn test_missing_attribute_is_usage_error() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    let err = publish_ids(&messaging, &topic, Some("order"), &["1"])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MessagingError::Usage(UsageError::MissingDeduplicationAttribute { ref attribute })
            if attribute == "order"
    ));
    assert!(err.is_usage_error());
    assert_eq!(broker.topic_len(&topic).unwrap(), 0);
}

/// Verify that fingerprints stop counting once the window passes
#[tokio::test]
async fn test_fingerprints_expire_after_window() {
    let (broker, messaging) =
        memory_messaging_with(MemorySettings::default(), Duration::from_millis(200));
    let topic = unique_topic("events");

    publish_ids(&messaging, &topic, Some("id"), &["1", "1"]).await.unwrap();
    assert_eq!(broker.topic_len(&topic).unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    publish_ids(&messaging, &topic, Some("id"), &["1"]).await.unwrap();
    assert_eq!(broker.topic_len(&topic).unwrap(), 2);
}

/// Verify that a send failing under a broken topic forgets the fingerprint
#[tokio::test]
async fn test_failed_send_is_forgotten() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    let guard = messaging.break_topic();
    let err = publish_ids(&messaging, &topic, Some("id"), &["1"])
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Transport { .. }));
    drop(guard);

    publish_ids(&messaging, &topic, Some("id"), &["1"]).await.unwrap();
    assert_eq!(broker.topic_len(&topic).unwrap(), 1);
}

/// Verify that clearing the cache makes every id novel again
#[tokio::test]
async fn test_clear_recently_seen_messages() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    publish_ids(&messaging, &topic, Some("id"), &["1", "2"]).await.unwrap();
    messaging
        .create_cache(&topic)
        .clear_recently_seen_messages()
        .await
        .unwrap();
    publish_ids(&messaging, &topic, Some("id"), &["1", "2"]).await.unwrap();

    assert_eq!(broker.topic_len(&topic).unwrap(), 4);
}

/// Verify that concurrent publishers of the same id let one copy through
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_send_one_copy() {
    let (broker, messaging) = memory_messaging();
    let topic = unique_topic("events");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let messaging = messaging.clone();
            let topic = topic.clone();
            tokio::spawn(async move { publish_ids(&messaging, &topic, Some("id"), &["same"]).await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.topic_len(&topic).unwrap(), 1);
}
