//! Message queue boundary.
//!
//! The queue is the dispatch and visibility mechanism: it hands out
//! deliveries, hides claimed deliveries for a visibility timeout and forgets
//! them once deleted. It is never the source of truth for job state.
//!
//! ## Receipts
//!
//! Every delivery carries an opaque `receipt_info`. Only the receipt of the
//! current delivery can extend or delete it; once a delivery's visibility
//! expires and the message is handed out again, the old receipt is stale.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use in_memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;

/// A claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Handle for extending or deleting this delivery.
    pub receipt_info: String,
    /// Serialized job envelope.
    pub message_body: Vec<u8>,
}

/// Queue operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("receipt is unknown or stale: {0}")]
    InvalidReceipt(String),

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("malformed queue entry: {0}")]
    Malformed(String),
}

/// Dispatch queue for job envelopes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a message body to the tail of the queue.
    async fn enqueue(&self, body: Vec<u8>) -> Result<(), QueueError>;

    /// Claim the head message, hiding it for the queue's visibility timeout.
    ///
    /// Returns `None` when no message is currently visible.
    async fn claim_head(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Keep the delivery hidden for `duration` from now.
    async fn extend_visibility(&self, receipt_info: &str, duration: Duration)
    -> Result<(), QueueError>;

    /// Remove the delivered message permanently.
    async fn delete(&self, receipt_info: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, body: Vec<u8>) -> Result<(), QueueError> {
        (**self).enqueue(body).await
    }

    async fn claim_head(&self) -> Result<Option<QueueMessage>, QueueError> {
        (**self).claim_head().await
    }

    async fn extend_visibility(
        &self,
        receipt_info: &str,
        duration: Duration,
    ) -> Result<(), QueueError> {
        (**self).extend_visibility(receipt_info, duration).await
    }

    async fn delete(&self, receipt_info: &str) -> Result<(), QueueError> {
        (**self).delete(receipt_info).await
    }
}
