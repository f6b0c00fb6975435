//! Scoped ephemeral subscriptions.
//!
//! An ephemeral subscription is a temporary consumer-side binding that must
//! not outlive its user. [`with_ephemeral_subscription`] is the preferred
//! form; [`EphemeralSubscription`] is the guard underneath it for callers that
//! cannot express their work as a single future.

use crate::broker::{Broker, SubscriptionParams};
use crate::error::MessagingError;
use crate::message::TopicName;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;

/// Live ephemeral subscription; removed by [`close`](Self::close) or on drop
pub struct EphemeralSubscription {
    broker: Arc<dyn Broker>,
    params: SubscriptionParams,
    closed: bool,
}

impl EphemeralSubscription {
    /// Create the subscription on the broker
    pub async fn open(broker: Arc<dyn Broker>, topic: &TopicName) -> Result<Self, MessagingError> {
        let params = broker.create_ephemeral_subscription(topic).await?;
        info!(
            topic = %params.topic,
            group = %params.group,
            backend = broker.name(),
            "Created ephemeral subscription"
        );

        Ok(Self {
            broker,
            params,
            closed: false,
        })
    }

    /// Parameters a consumer needs to attach
    pub fn params(&self) -> &SubscriptionParams {
        &self.params
    }

    /// Delete the subscription. If this future is dropped before deletion
    /// finishes, the guard falls back to deleting on drop.
    pub async fn close(mut self) -> Result<(), MessagingError> {
        let result = delete(self.broker.as_ref(), &self.params).await;
        self.closed = true;
        result
    }
}

impl Drop for EphemeralSubscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        // Dropped without close(): panic or cancellation. Deletion is async,
        // so it is handed to the runtime if there is one.
        let broker = Arc::clone(&self.broker);
        let params = self.params.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = delete(broker.as_ref(), &params).await {
                        warn!(group = %params.group, error = %e, "Deferred ephemeral subscription cleanup failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    topic = %self.params.topic,
                    group = %self.params.group,
                    "Ephemeral subscription dropped outside a runtime; it was not deleted"
                );
            }
        }
    }
}

async fn delete(broker: &dyn Broker, params: &SubscriptionParams) -> Result<(), MessagingError> {
    broker.delete_ephemeral_subscription(params).await?;
    info!(
        topic = %params.topic,
        group = %params.group,
        backend = broker.name(),
        "Deleted ephemeral subscription"
    );
    Ok(())
}

/// Run `body` with a fresh ephemeral subscription on `topic`, deleting the
/// subscription afterwards whether the body succeeded or failed.
///
/// The body's error wins over a cleanup error.
pub async fn with_ephemeral_subscription<F, Fut, T, E>(
    broker: Arc<dyn Broker>,
    topic: &TopicName,
    body: F,
) -> Result<T, E>
where
    F: FnOnce(SubscriptionParams) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<MessagingError>,
{
    let subscription = EphemeralSubscription::open(broker, topic).await?;
    let result = body(subscription.params().clone()).await;
    let cleanup = subscription.close().await;

    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup_error)) => Err(cleanup_error.into()),
        (Err(body_error), Ok(())) => Err(body_error),
        (Err(body_error), Err(cleanup_error)) => {
            warn!(error = %cleanup_error, "Ephemeral subscription cleanup failed after body error");
            Err(body_error)
        }
    }
}
