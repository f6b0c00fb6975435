//! Tests for scoped ephemeral subscriptions.

use super::*;
use crate::broker::TopicBreak;
use crate::cache::Cache;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::providers::InMemoryBroker;
use crate::publisher::Publisher;
use async_trait::async_trait;
use std::time::Duration;

fn topic() -> TopicName {
    TopicName::new("events".to_string()).unwrap()
}

fn brokers() -> (Arc<InMemoryBroker>, Arc<dyn Broker>) {
    let broker = Arc::new(InMemoryBroker::default());
    let shared: Arc<dyn Broker> = broker.clone();
    (broker, shared)
}

/// Broker whose subscription deletion takes a while to complete
struct SlowDeleteBroker {
    inner: InMemoryBroker,
    delay: Duration,
}

#[async_trait]
impl Broker for SlowDeleteBroker {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn create_publisher(
        &self,
        topic: TopicName,
        cache: Arc<dyn Cache>,
        deduplicate_by: Option<String>,
    ) -> Box<dyn Publisher> {
        self.inner.create_publisher(topic, cache, deduplicate_by)
    }

    fn create_consumer(&self, topic: TopicName, options: ConsumerOptions) -> Box<dyn Consumer> {
        self.inner.create_consumer(topic, options)
    }

    async fn create_ephemeral_subscription(
        &self,
        topic: &TopicName,
    ) -> Result<SubscriptionParams, MessagingError> {
        self.inner.create_ephemeral_subscription(topic).await
    }

    async fn delete_ephemeral_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> Result<(), MessagingError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete_ephemeral_subscription(params).await
    }

    fn break_topic(&self) -> TopicBreak {
        self.inner.break_topic()
    }
}

#[tokio::test]
async fn test_subscription_exists_only_inside_body() {
    let (broker, shared) = brokers();
    let events = topic();

    let seen = with_ephemeral_subscription(shared, &events, |params| {
        let names = broker.subscription_names(&params.topic).unwrap();
        async move { Ok::<_, MessagingError>((params, names)) }
    })
    .await
    .unwrap();

    let (params, names_inside) = seen;
    assert_eq!(names_inside, vec![params.group.clone()]);
    assert!(broker.subscription_names(&events).unwrap().is_empty());
}

#[tokio::test]
async fn test_body_error_still_removes_subscription() {
    let (broker, shared) = brokers();
    let events = topic();

    let result: Result<(), anyhow::Error> = with_ephemeral_subscription(shared, &events, |_params| async {
        Err(anyhow::anyhow!("body failed"))
    })
    .await;

    assert_eq!(result.unwrap_err().to_string(), "body failed");
    assert!(broker.subscription_names(&events).unwrap().is_empty());
}

#[tokio::test]
async fn test_each_subscription_is_unique() {
    let (_broker, shared) = brokers();
    let events = topic();

    let first = EphemeralSubscription::open(Arc::clone(&shared), &events).await.unwrap();
    let second = EphemeralSubscription::open(Arc::clone(&shared), &events).await.unwrap();

    assert_ne!(first.params().group, second.params().group);
    assert_eq!(first.params().topic, events);

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_guard_close_removes_subscription() {
    let (broker, shared) = brokers();
    let events = topic();

    let subscription = EphemeralSubscription::open(shared, &events).await.unwrap();
    assert_eq!(broker.subscription_names(&events).unwrap().len(), 1);

    subscription.close().await.unwrap();
    assert!(broker.subscription_names(&events).unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_guard_removes_subscription_in_background() {
    let (broker, shared) = brokers();
    let events = topic();

    let subscription = EphemeralSubscription::open(shared, &events).await.unwrap();
    drop(subscription);

    for _ in 0..50 {
        if broker.subscription_names(&events).unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dropped subscription was never removed");
}

#[tokio::test]
async fn test_cancelled_close_still_removes_subscription() {
    let broker = Arc::new(SlowDeleteBroker {
        inner: InMemoryBroker::default(),
        delay: Duration::from_millis(50),
    });
    let shared: Arc<dyn Broker> = broker.clone();
    let events = topic();

    let subscription = EphemeralSubscription::open(shared, &events).await.unwrap();
    let close = tokio::time::timeout(Duration::from_millis(5), subscription.close()).await;
    assert!(close.is_err());
    assert_eq!(broker.inner.subscription_names(&events).unwrap().len(), 1);

    for _ in 0..50 {
        if broker.inner.subscription_names(&events).unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subscription was left behind after close was cancelled");
}

#[test]
fn test_dropped_guard_outside_runtime_does_not_panic() {
    let (broker, shared) = brokers();
    let events = topic();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let subscription = runtime
        .block_on(EphemeralSubscription::open(shared, &events))
        .unwrap();
    drop(runtime);

    drop(subscription);
    assert_eq!(broker.subscription_names(&events).unwrap().len(), 1);
}
