//! Redis Streams-backed job queue.
//!
//! ## Layout
//!
//! - **Stream** (`jobwarden:jobs` by default): one entry per enqueued
//!   envelope, field `body`.
//! - **Consumer group** (`jobwarden`): a claimed entry stays in the group's
//!   pending list until it is deleted.
//! - **Deadline hash** (`<stream>:deadlines`): entry id to
//!   `<visible-at unix ms>|<delivery token>` for every claimed entry.
//!
//! A receipt is `<entry id>#<delivery token>`. The token changes on every
//! delivery, so a receipt from an expired delivery is rejected once the
//! entry has been handed out again.
//!
//! Claiming prefers pending entries whose deadline has passed (XPENDING +
//! XCLAIM) over new entries (XREADGROUP). The pending list is walked page by
//! page with exclusive range starts, which needs Redis 6.2 or later. Delete
//! is XACK + XDEL + HDEL in one MULTI.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueMessage};

const DEFAULT_STREAM_KEY: &str = "jobwarden:jobs";
const DEFAULT_GROUP: &str = "jobwarden";
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending entries fetched per XPENDING page.
const PENDING_PAGE_SIZE: usize = 32;

const BODY_FIELD: &str = "body";
const RECEIPT_SEPARATOR: char = '#';
const DEADLINE_SEPARATOR: char = '|';

pub struct RedisStreamsJobQueue {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    stream_key: String,
    deadlines_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for RedisStreamsJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsJobQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsJobQueue {
    /// Create a queue client.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream key (default: "jobwarden:jobs")
    pub fn new(redis_url: impl AsRef<str>, stream_key: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let stream_key = stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string());

        Ok(Self {
            client,
            connection: OnceCell::new(),
            deadlines_key: format!("{stream_key}:deadlines"),
            stream_key,
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Create the stream and consumer group if missing (idempotent).
    #[instrument(skip(self), fields(stream_key = %self.stream_key, group = %self.group), err)]
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let created: redis::RedisResult<Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, Value>(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))
            })
            .await
            .cloned()
    }

    /// Claim the oldest pending entry whose visibility deadline has passed.
    async fn claim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        now_ms: i64,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut start = "-".to_string();
        loop {
            let pending = redis::cmd("XPENDING")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&start)
                .arg("+")
                .arg(PENDING_PAGE_SIZE)
                .query_async::<_, Value>(conn)
                .await
                .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

            let rows = parse_pending(pending)?;
            let next_start = next_pending_start(&rows, PENDING_PAGE_SIZE);

            for (entry_id, idle_ms) in rows {
                let reclaimed = self
                    .reclaim_if_expired(conn, entry_id, idle_ms, now_ms)
                    .await?;
                if reclaimed.is_some() {
                    return Ok(reclaimed);
                }
            }

            match next_start {
                Some(next) => start = next,
                None => return Ok(None),
            }
        }
    }

    async fn reclaim_if_expired(
        &self,
        conn: &mut MultiplexedConnection,
        entry_id: String,
        idle_ms: i64,
        now_ms: i64,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = redis::cmd("HGET")
            .arg(&self.deadlines_key)
            .arg(&entry_id)
            .query_async::<_, Option<String>>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("HGET failed: {e}")))?;

        let expired = match deadline.as_deref().map(parse_deadline).transpose()? {
            Some((visible_at_ms, _)) => visible_at_ms <= now_ms,
            None => true,
        };
        if !expired {
            return Ok(None);
        }

        // Requiring the observed idle time means a concurrent claimer
        // that got there first resets it and we get nothing back.
        let claimed = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(idle_ms)
            .arg(&entry_id)
            .query_async::<_, Value>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;

        match parse_entries(claimed)?.into_iter().next() {
            Some((id, body)) => {
                debug!(entry_id = %id, "redelivering expired entry");
                self.deliver(conn, id, body, now_ms).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn claim_new(
        &self,
        conn: &mut MultiplexedConnection,
        now_ms: i64,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async::<_, Value>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        match parse_read_reply(reply)?.into_iter().next() {
            Some((id, body)) => self.deliver(conn, id, body, now_ms).await.map(Some),
            None => Ok(None),
        }
    }

    /// Record a fresh deadline and token for `entry_id` and build the receipt.
    async fn deliver(
        &self,
        conn: &mut MultiplexedConnection,
        entry_id: String,
        body: Vec<u8>,
        now_ms: i64,
    ) -> Result<QueueMessage, QueueError> {
        let token = Uuid::now_v7().simple().to_string();
        let visible_at_ms = now_ms.saturating_add(duration_ms(self.visibility_timeout));

        redis::cmd("HSET")
            .arg(&self.deadlines_key)
            .arg(&entry_id)
            .arg(format_deadline(visible_at_ms, &token))
            .query_async::<_, Value>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("HSET failed: {e}")))?;

        Ok(QueueMessage {
            receipt_info: format_receipt(&entry_id, &token),
            message_body: body,
        })
    }

    /// Resolve a receipt to its entry id if it belongs to the current delivery.
    async fn current_delivery(
        &self,
        conn: &mut MultiplexedConnection,
        receipt_info: &str,
    ) -> Result<String, QueueError> {
        let (entry_id, token) = parse_receipt(receipt_info)?;

        let deadline = redis::cmd("HGET")
            .arg(&self.deadlines_key)
            .arg(entry_id)
            .query_async::<_, Option<String>>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("HGET failed: {e}")))?
            .ok_or_else(|| QueueError::InvalidReceipt(receipt_info.to_string()))?;

        let (_, current_token) = parse_deadline(&deadline)?;
        if current_token != token {
            return Err(QueueError::InvalidReceipt(receipt_info.to_string()));
        }
        Ok(entry_id.to_string())
    }
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(skip(self, body), fields(stream_key = %self.stream_key), err)]
    async fn enqueue(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    async fn claim_head(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        if let Some(message) = self.claim_expired(&mut conn, now_ms).await? {
            return Ok(Some(message));
        }
        self.claim_new(&mut conn, now_ms).await
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    async fn extend_visibility(
        &self,
        receipt_info: &str,
        duration: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let entry_id = self.current_delivery(&mut conn, receipt_info).await?;
        let (_, token) = parse_receipt(receipt_info)?;

        let visible_at_ms = chrono::Utc::now()
            .timestamp_millis()
            .saturating_add(duration_ms(duration));
        redis::cmd("HSET")
            .arg(&self.deadlines_key)
            .arg(&entry_id)
            .arg(format_deadline(visible_at_ms, token))
            .query_async::<_, Value>(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("HSET failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    async fn delete(&self, receipt_info: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let entry_id = self.current_delivery(&mut conn, receipt_info).await?;

        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&entry_id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.deadlines_key)
            .arg(&entry_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("delete failed: {e}")))?;
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn format_receipt(entry_id: &str, token: &str) -> String {
    format!("{entry_id}{RECEIPT_SEPARATOR}{token}")
}

fn parse_receipt(receipt_info: &str) -> Result<(&str, &str), QueueError> {
    match receipt_info.split_once(RECEIPT_SEPARATOR) {
        Some((id, token)) if !id.is_empty() && !token.is_empty() => Ok((id, token)),
        _ => Err(QueueError::InvalidReceipt(receipt_info.to_string())),
    }
}

fn format_deadline(visible_at_ms: i64, token: &str) -> String {
    format!("{visible_at_ms}{DEADLINE_SEPARATOR}{token}")
}

fn parse_deadline(raw: &str) -> Result<(i64, &str), QueueError> {
    let malformed = || QueueError::Malformed(format!("deadline '{raw}'"));
    let (ms, token) = raw.split_once(DEADLINE_SEPARATOR).ok_or_else(malformed)?;
    let ms = ms.parse::<i64>().map_err(|_| malformed())?;
    Ok((ms, token))
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Data(data) => std::str::from_utf8(data).ok()?.parse().ok(),
        _ => None,
    }
}

/// Parse an extended XPENDING reply into `(entry id, idle ms)` pairs.
///
/// Reply format: `[[id, consumer, idle_ms, delivery_count], ...]`
fn parse_pending(reply: Value) -> Result<Vec<(String, i64)>, QueueError> {
    let rows = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(rows) => rows,
        _ => return Err(QueueError::Malformed("XPENDING reply".to_string())),
    };

    rows.iter()
        .map(|row| match row {
            Value::Bulk(fields) if fields.len() >= 3 => {
                let id = value_string(&fields[0]);
                let idle = value_i64(&fields[2]);
                id.zip(idle)
                    .ok_or_else(|| QueueError::Malformed("XPENDING row".to_string()))
            }
            _ => Err(QueueError::Malformed("XPENDING row".to_string())),
        })
        .collect()
}

/// Exclusive XPENDING start for the page after `rows`, or `None` when `rows`
/// was the last page.
fn next_pending_start(rows: &[(String, i64)], page_size: usize) -> Option<String> {
    if rows.len() < page_size {
        return None;
    }
    rows.last().map(|(id, _)| format!("({id}"))
}

/// Parse stream entries (`[[id, [field, value, ...]], ...]`) into
/// `(entry id, body)` pairs. Entries deleted under a pending id come back
/// with nil fields and are skipped.
fn parse_entries(reply: Value) -> Result<Vec<(String, Vec<u8>)>, QueueError> {
    let entries = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(entries) => entries,
        _ => return Err(QueueError::Malformed("stream entries".to_string())),
    };

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Bulk(parts) = entry else {
            return Err(QueueError::Malformed("stream entry".to_string()));
        };
        let id = parts
            .first()
            .and_then(value_string)
            .ok_or_else(|| QueueError::Malformed("stream entry id".to_string()))?;
        let Some(Value::Bulk(fields)) = parts.get(1) else {
            continue;
        };

        let body = fields.chunks(2).find_map(|pair| match pair {
            [Value::Data(key), Value::Data(value)] if key.as_slice() == BODY_FIELD.as_bytes() => {
                Some(value.clone())
            }
            _ => None,
        });
        match body {
            Some(body) => parsed.push((id, body)),
            None => return Err(QueueError::Malformed(format!("entry {id} has no body"))),
        }
    }
    Ok(parsed)
}

/// Parse an XREADGROUP reply: `[[stream, [entries...]], ...]` or nil.
fn parse_read_reply(reply: Value) -> Result<Vec<(String, Vec<u8>)>, QueueError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        _ => return Err(QueueError::Malformed("XREADGROUP reply".to_string())),
    };

    let mut parsed = Vec::new();
    for stream in streams {
        match stream {
            Value::Bulk(mut parts) if parts.len() == 2 => {
                parsed.extend(parse_entries(parts.remove(1))?);
            }
            _ => return Err(QueueError::Malformed("XREADGROUP stream".to_string())),
        }
    }
    Ok(parsed)
}
