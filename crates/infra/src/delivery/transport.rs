//! Queue transport abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chronicle_events::Subscription;

use super::message::DeliveredMessage;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection error: {0}")]
    Connection(String),
    #[error("transport command error: {0}")]
    Command(String),
    #[error("transport state error: {0}")]
    State(String),
}

/// Something went wrong with a message outside of the adapter's control:
/// a lost lock, a failed reclaim, a message moved to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub message_id: Option<String>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// At-least-once message queue.
///
/// A received message stays owned by the receiver until it is completed or
/// its visibility window lapses, after which the transport redelivers it.
/// There is no explicit reject: leaving a message alone is the retry path.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a message body. Returns the transport's message id.
    ///
    /// With `not_before`, the message is not delivered before that instant and
    /// no delivery attempts are counted against it until then.
    async fn send(&self, body: String, not_before: Option<DateTime<Utc>>) -> Result<String, TransportError>;

    /// Up to `max` messages, waiting at most `wait` when none are ready.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<DeliveredMessage>, TransportError>;

    /// Acknowledge a message so it is never redelivered. Idempotent.
    async fn complete(&self, message: &DeliveredMessage) -> Result<(), TransportError>;

    /// Fault notifications raised after this call.
    fn faults(&self) -> Subscription<TransportFault>;
}

#[async_trait]
impl<T> QueueTransport for Arc<T>
where
    T: QueueTransport + ?Sized,
{
    async fn send(&self, body: String, not_before: Option<DateTime<Utc>>) -> Result<String, TransportError> {
        (**self).send(body, not_before).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<DeliveredMessage>, TransportError> {
        (**self).receive(max, wait).await
    }

    async fn complete(&self, message: &DeliveredMessage) -> Result<(), TransportError> {
        (**self).complete(message).await
    }

    fn faults(&self) -> Subscription<TransportFault> {
        (**self).faults()
    }
}
