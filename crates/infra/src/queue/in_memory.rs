use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueMessage};

/// Default time a claimed delivery stays hidden.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Delivery {
    receipt: String,
    visible_at: Instant,
}

#[derive(Debug)]
struct Entry {
    body: Vec<u8>,
    delivery: Option<Delivery>,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.delivery.as_ref().is_none_or(|d| d.visible_at <= now)
    }
}

/// In-memory FIFO queue with visibility timeouts.
///
/// Intended for tests/dev. Uses tokio's clock, so paused-time tests can
/// expire deliveries deterministically.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    entries: RwLock<VecDeque<Entry>>,
    visibility_timeout: Duration,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// A zero timeout makes every claimed message immediately claimable
    /// again, which simulates redelivery.
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            visibility_timeout,
        }
    }

    /// Number of messages held (visible or in flight).
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> QueueError {
        QueueError::Command("lock poisoned".to_string())
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.push_back(Entry {
            body,
            delivery: None,
        });
        Ok(())
    }

    async fn claim_head(&self) -> Result<Option<QueueMessage>, QueueError> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;

        let Some(entry) = entries.iter_mut().find(|e| e.is_visible(now)) else {
            return Ok(None);
        };

        let receipt = Uuid::now_v7().to_string();
        entry.delivery = Some(Delivery {
            receipt: receipt.clone(),
            visible_at: now + self.visibility_timeout,
        });

        Ok(Some(QueueMessage {
            receipt_info: receipt,
            message_body: entry.body.clone(),
        }))
    }

    async fn extend_visibility(
        &self,
        receipt_info: &str,
        duration: Duration,
    ) -> Result<(), QueueError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let delivery = entries
            .iter_mut()
            .filter_map(|e| e.delivery.as_mut())
            .find(|d| d.receipt == receipt_info)
            .ok_or_else(|| QueueError::InvalidReceipt(receipt_info.to_string()))?;

        delivery.visible_at = Instant::now() + duration;
        Ok(())
    }

    async fn delete(&self, receipt_info: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let position = entries
            .iter()
            .position(|e| {
                e.delivery
                    .as_ref()
                    .is_some_and(|d| d.receipt == receipt_info)
            })
            .ok_or_else(|| QueueError::InvalidReceipt(receipt_info.to_string()))?;

        entries.remove(position);
        Ok(())
    }
}
