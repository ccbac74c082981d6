//! Record store codec.
//!
//! Maps [`JobRecord`]s onto the attribute items persisted by the record
//! store, and back. One item per job, keyed by `job_id`:
//!
//! | attribute | value | encoding |
//! |---|---|---|
//! | `job_id` | `S` | partition key |
//! | `server_job_id` | `S` | |
//! | `job_body` | `S` | |
//! | `job_status` | `S` | `CREATED`, `PROCESSING`, ... |
//! | `created_time` | `S` | RFC 3339, nanoseconds, `Z` |
//! | `updated_time` | `S` | RFC 3339, nanoseconds, `Z` |
//! | `processing_started_time` | `S` | RFC 3339, nanoseconds, `Z` |
//! | `retry_count` | `N` | |
//! | `ttl` | `N` | optional, Unix seconds of expiry |
//!
//! Reads tolerate unknown attributes so the schema can grow.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{JobRecord, JobRecordPatch, JobStatus};

pub mod attr {
    pub const JOB_ID: &str = "job_id";
    pub const SERVER_JOB_ID: &str = "server_job_id";
    pub const JOB_BODY: &str = "job_body";
    pub const JOB_STATUS: &str = "job_status";
    pub const CREATED_TIME: &str = "created_time";
    pub const UPDATED_TIME: &str = "updated_time";
    pub const PROCESSING_STARTED_TIME: &str = "processing_started_time";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const TTL: &str = "ttl";
}

/// Attributes every readable record must carry.
const REQUIRED_ATTRIBUTES: [&str; 8] = [
    attr::JOB_ID,
    attr::SERVER_JOB_ID,
    attr::JOB_BODY,
    attr::JOB_STATUS,
    attr::CREATED_TIME,
    attr::UPDATED_TIME,
    attr::PROCESSING_STARTED_TIME,
    attr::RETRY_COUNT,
];

/// A single stored attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// String.
    S(String),
    /// Number.
    N(i64),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            AttributeValue::N(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            AttributeValue::S(_) => None,
        }
    }
}

/// A stored item: attribute name to value.
pub type Item = HashMap<String, AttributeValue>;

/// Create-if-absent write of a full record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateItem {
    pub table_name: String,
    pub key: String,
    pub attributes: Item,
}

/// Compare-and-swap guard: the stored attribute must equal `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCondition {
    pub attribute: String,
    pub expected: AttributeValue,
}

impl WriteCondition {
    /// Guard a write on the stored `updated_time` still being `observed`.
    pub fn updated_time_is(observed: DateTime<Utc>) -> Self {
        Self {
            attribute: attr::UPDATED_TIME.to_string(),
            expected: AttributeValue::S(format_timestamp(observed)),
        }
    }
}

/// Partial upsert; attributes present overwrite, absent ones are untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertItem {
    pub table_name: String,
    pub key: String,
    pub attributes: Item,
    pub condition: Option<WriteCondition>,
}

impl UpsertItem {
    pub fn with_condition(mut self, condition: WriteCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, JobError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobError::invalid_item(format!("malformed timestamp '{s}': {e}")))
}

fn string(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn timestamp(at: DateTime<Utc>) -> AttributeValue {
    AttributeValue::S(format_timestamp(at))
}

/// Full write for a new record.
///
/// Fails with `InvalidTtl` when `ttl` is negative. The stored `ttl` is the
/// expiry instant `created_time + ttl` in Unix seconds.
pub fn to_store_write(
    table_name: &str,
    record: &JobRecord,
    ttl: Option<chrono::Duration>,
) -> Result<CreateItem, JobError> {
    let mut attributes = Item::with_capacity(REQUIRED_ATTRIBUTES.len() + 1);
    attributes.insert(attr::JOB_ID.into(), string(&record.job_id));
    attributes.insert(attr::SERVER_JOB_ID.into(), string(&record.server_job_id));
    attributes.insert(attr::JOB_BODY.into(), string(&record.job_body));
    attributes.insert(attr::JOB_STATUS.into(), string(record.job_status.as_str()));
    attributes.insert(attr::CREATED_TIME.into(), timestamp(record.created_time));
    attributes.insert(attr::UPDATED_TIME.into(), timestamp(record.updated_time));
    attributes.insert(
        attr::PROCESSING_STARTED_TIME.into(),
        timestamp(record.processing_started_time),
    );
    attributes.insert(
        attr::RETRY_COUNT.into(),
        AttributeValue::N(i64::from(record.retry_count)),
    );

    if let Some(ttl) = ttl {
        if ttl < chrono::Duration::zero() {
            return Err(JobError::invalid_ttl(format!(
                "ttl must not be negative, got {}s",
                ttl.num_seconds()
            )));
        }
        let expires_at = record.created_time.timestamp().saturating_add(ttl.num_seconds());
        attributes.insert(attr::TTL.into(), AttributeValue::N(expires_at));
    }

    Ok(CreateItem {
        table_name: table_name.to_string(),
        key: record.job_id.clone(),
        attributes,
    })
}

/// Partial write carrying only the fields set on `patch`.
///
/// `job_id` and `updated_time` are always written; `retry_count` travels
/// with a status change.
pub fn to_partial_store_write(table_name: &str, patch: &JobRecordPatch) -> UpsertItem {
    let mut attributes = Item::new();
    attributes.insert(attr::JOB_ID.into(), string(&patch.job_id));
    attributes.insert(attr::UPDATED_TIME.into(), timestamp(patch.updated_time));

    if let Some(server_job_id) = &patch.server_job_id {
        attributes.insert(attr::SERVER_JOB_ID.into(), string(server_job_id));
    }
    if let Some(body) = &patch.job_body {
        attributes.insert(attr::JOB_BODY.into(), string(body));
    }
    if let Some(change) = &patch.status {
        attributes.insert(attr::JOB_STATUS.into(), string(change.status.as_str()));
        attributes.insert(
            attr::RETRY_COUNT.into(),
            AttributeValue::N(i64::from(change.retry_count)),
        );
    }
    if let Some(created) = patch.created_time {
        attributes.insert(attr::CREATED_TIME.into(), timestamp(created));
    }
    if let Some(started) = patch.processing_started_time {
        attributes.insert(attr::PROCESSING_STARTED_TIME.into(), timestamp(started));
    }

    UpsertItem {
        table_name: table_name.to_string(),
        key: patch.job_id.clone(),
        attributes,
        condition: None,
    }
}

fn required_str<'a>(item: &'a Item, name: &str) -> Result<&'a str, JobError> {
    item.get(name)
        .ok_or_else(|| JobError::invalid_item(format!("missing attribute '{name}'")))?
        .as_str()
        .ok_or_else(|| JobError::invalid_item(format!("attribute '{name}' is not a string")))
}

fn required_timestamp(item: &Item, name: &str) -> Result<DateTime<Utc>, JobError> {
    parse_timestamp(required_str(item, name)?)
}

/// Decode a stored item into a [`JobRecord`].
pub fn from_store_read(item: &Item) -> Result<JobRecord, JobError> {
    if !item.contains_key(attr::JOB_ID) {
        return Err(JobError::invalid_item("missing partition key 'job_id'"));
    }
    let present = REQUIRED_ATTRIBUTES
        .iter()
        .filter(|name| item.contains_key(**name))
        .count();
    if present < REQUIRED_ATTRIBUTES.len() {
        return Err(JobError::invalid_item(format!(
            "expected {} record attributes, found {present}",
            REQUIRED_ATTRIBUTES.len()
        )));
    }

    let job_status = required_str(item, attr::JOB_STATUS)?.parse::<JobStatus>()?;
    let retry_count = item
        .get(attr::RETRY_COUNT)
        .and_then(AttributeValue::as_i64)
        .ok_or_else(|| JobError::invalid_item("attribute 'retry_count' is not a number"))?;
    let retry_count = u32::try_from(retry_count)
        .map_err(|_| JobError::invalid_item(format!("retry_count out of range: {retry_count}")))?;

    Ok(JobRecord {
        job_id: required_str(item, attr::JOB_ID)?.to_string(),
        server_job_id: required_str(item, attr::SERVER_JOB_ID)?.to_string(),
        job_body: required_str(item, attr::JOB_BODY)?.to_string(),
        job_status,
        created_time: required_timestamp(item, attr::CREATED_TIME)?,
        updated_time: required_timestamp(item, attr::UPDATED_TIME)?,
        processing_started_time: required_timestamp(item, attr::PROCESSING_STARTED_TIME)?,
        retry_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::zero_time;
    use proptest::prelude::*;

    fn sample_record() -> JobRecord {
        let now = Utc::now();
        JobRecord::build(
            "job-1",
            "token-1",
            "{\"input\":\"gs://bucket/a\"}",
            JobStatus::Processing,
            now,
            now,
            now,
            3,
        )
    }

    #[test]
    fn store_write_carries_every_attribute() {
        let record = sample_record();
        let write = to_store_write("jobs", &record, None).unwrap();

        assert_eq!(write.table_name, "jobs");
        assert_eq!(write.key, "job-1");
        assert_eq!(write.attributes.len(), REQUIRED_ATTRIBUTES.len());
        assert_eq!(
            write.attributes.get(attr::JOB_STATUS),
            Some(&AttributeValue::S("PROCESSING".into()))
        );
        assert_eq!(write.attributes.get(attr::RETRY_COUNT), Some(&AttributeValue::N(3)));
    }

    #[test]
    fn ttl_is_stored_as_expiry_and_negative_ttl_is_rejected() {
        let record = sample_record();

        let write = to_store_write("jobs", &record, Some(chrono::Duration::zero())).unwrap();
        assert_eq!(
            write.attributes.get(attr::TTL),
            Some(&AttributeValue::N(record.created_time.timestamp()))
        );

        let write = to_store_write("jobs", &record, Some(chrono::Duration::seconds(60))).unwrap();
        assert_eq!(
            write.attributes.get(attr::TTL),
            Some(&AttributeValue::N(record.created_time.timestamp() + 60))
        );

        let err = to_store_write("jobs", &record, Some(chrono::Duration::seconds(-1))).unwrap_err();
        assert!(matches!(err, JobError::InvalidTtl(_)));
    }

    #[test]
    fn partial_write_only_contains_set_fields() {
        let now = Utc::now();
        let body_only = to_partial_store_write("jobs", &JobRecordPatch::new("job-1", now).with_body("new"));
        let mut keys: Vec<_> = body_only.attributes.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![attr::JOB_BODY, attr::JOB_ID, attr::UPDATED_TIME]);
        assert!(body_only.condition.is_none());

        let status = to_partial_store_write(
            "jobs",
            &JobRecordPatch::new("job-1", now).with_status(JobStatus::Processing, 2),
        );
        assert_eq!(status.attributes.get(attr::RETRY_COUNT), Some(&AttributeValue::N(2)));
        assert!(!status.attributes.contains_key(attr::PROCESSING_STARTED_TIME));
    }

    #[test]
    fn read_requires_partition_key() {
        let mut item = to_store_write("jobs", &sample_record(), None).unwrap().attributes;
        item.remove(attr::JOB_ID);
        let err = from_store_read(&item).unwrap_err();
        assert!(matches!(err, JobError::InvalidItem(msg) if msg.contains("partition key")));
    }

    #[test]
    fn read_requires_minimum_attribute_set() {
        let mut item = to_store_write("jobs", &sample_record(), None).unwrap().attributes;
        item.remove(attr::PROCESSING_STARTED_TIME);
        item.insert("unrelated".into(), AttributeValue::S("x".into()));
        assert!(matches!(from_store_read(&item), Err(JobError::InvalidItem(_))));
    }

    #[test]
    fn read_rejects_unknown_status_string() {
        let mut item = to_store_write("jobs", &sample_record(), None).unwrap().attributes;
        item.insert(attr::JOB_STATUS.into(), AttributeValue::S("PAUSED".into()));
        assert!(matches!(from_store_read(&item), Err(JobError::InvalidJobStatus(_))));
    }

    #[test]
    fn read_rejects_malformed_values() {
        let mut item = to_store_write("jobs", &sample_record(), None).unwrap().attributes;
        item.insert(attr::CREATED_TIME.into(), AttributeValue::S("yesterday".into()));
        assert!(matches!(from_store_read(&item), Err(JobError::InvalidItem(_))));

        let mut item = to_store_write("jobs", &sample_record(), None).unwrap().attributes;
        item.insert(attr::RETRY_COUNT.into(), AttributeValue::N(-4));
        assert!(matches!(from_store_read(&item), Err(JobError::InvalidItem(_))));
    }

    #[test]
    fn zero_start_time_survives_encoding() {
        let record = JobRecord::created("job-2", "token", "body", Utc::now());
        let item = to_store_write("jobs", &record, None).unwrap().attributes;
        let decoded = from_store_read(&item).unwrap();
        assert_eq!(decoded.processing_started_time, zero_time());
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        /// Full write, merged with the equivalent partial write, decodes to
        /// the same record whatever order the attributes arrive in.
        #[test]
        fn full_and_partial_writes_decode_to_same_record(
            job_id in "[a-z0-9-]{1,24}",
            body in ".{0,64}",
            status in any_status(),
            retry_count in 0u32..1_000,
            offset_secs in 0i64..1_000_000,
            extra in prop::collection::hash_map("x_[a-z]{1,8}", ".{0,8}", 0..4),
        ) {
            let created = DateTime::<Utc>::default() + chrono::Duration::seconds(1_700_000_000);
            let updated = created + chrono::Duration::seconds(offset_secs);
            let record = JobRecord::build(
                job_id, "token", body, status, created, updated, updated, retry_count,
            );

            let create = to_store_write("jobs", &record, None).unwrap();
            let upsert = to_partial_store_write("jobs", &JobRecordPatch::from(&record));

            let mut pairs: Vec<(String, AttributeValue)> = create.attributes.into_iter().collect();
            pairs.extend(upsert.attributes);
            pairs.extend(extra.into_iter().map(|(k, v)| (k, AttributeValue::S(v))));
            pairs.reverse();

            let item: Item = pairs.into_iter().collect();
            prop_assert_eq!(from_store_read(&item).unwrap(), record);
        }
    }
}
