//! Job record and status machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Lifecycle status of a job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted, waiting for a worker.
    Created,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully (terminal).
    Success,
    /// Finished unsuccessfully (terminal).
    Failure,
    /// Never a valid transition target.
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Created,
        JobStatus::Processing,
        JobStatus::Success,
        JobStatus::Failure,
        JobStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    /// CREATED and PROCESSING are the statuses a worker may still act on.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Created | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "PROCESSING" => Ok(JobStatus::Processing),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            "UNKNOWN" => Ok(JobStatus::Unknown),
            other => Err(JobError::invalid_status(format!("unrecognized status '{other}'"))),
        }
    }
}

/// Check a requested status change against the transition table.
///
/// Allowed iff the target is not UNKNOWN and the current status is CREATED
/// or PROCESSING. Terminal records accept no further transitions, including
/// re-observation of the same status.
pub fn validate_transition(current: JobStatus, requested: JobStatus) -> Result<(), JobError> {
    if requested == JobStatus::Unknown {
        return Err(JobError::invalid_status(format!(
            "{current} -> {requested}: UNKNOWN is not a valid target"
        )));
    }
    if !current.is_active() {
        return Err(JobError::invalid_status(format!(
            "{current} -> {requested}: record is not active"
        )));
    }
    Ok(())
}

/// The zero-value timestamp (Unix epoch), used for "never started".
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// System-of-record entity, one per logical job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub server_job_id: String,
    pub job_body: String,
    pub job_status: JobStatus,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub processing_started_time: DateTime<Utc>,
    pub retry_count: u32,
}

impl JobRecord {
    /// Build a record from its parts.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        job_id: impl Into<String>,
        server_job_id: impl Into<String>,
        job_body: impl Into<String>,
        job_status: JobStatus,
        created_time: DateTime<Utc>,
        updated_time: DateTime<Utc>,
        processing_started_time: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            server_job_id: server_job_id.into(),
            job_body: job_body.into(),
            job_status,
            created_time,
            updated_time,
            processing_started_time,
            retry_count,
        }
    }

    /// A freshly submitted record: CREATED, never started, no retries.
    pub fn created(
        job_id: impl Into<String>,
        server_job_id: impl Into<String>,
        job_body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            job_id,
            server_job_id,
            job_body,
            JobStatus::Created,
            now,
            now,
            zero_time(),
            0,
        )
    }
}

/// A status change carried by a partial write; `retry_count` travels with it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub retry_count: u32,
}

/// Partial update of a [`JobRecord`].
///
/// Only `Some` fields are written. `updated_time` is always written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecordPatch {
    pub job_id: String,
    pub server_job_id: Option<String>,
    pub job_body: Option<String>,
    pub status: Option<StatusChange>,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: DateTime<Utc>,
    pub processing_started_time: Option<DateTime<Utc>>,
}

impl JobRecordPatch {
    pub fn new(job_id: impl Into<String>, updated_time: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            server_job_id: None,
            job_body: None,
            status: None,
            created_time: None,
            updated_time,
            processing_started_time: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.job_body = Some(body.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus, retry_count: u32) -> Self {
        self.status = Some(StatusChange {
            status,
            retry_count,
        });
        self
    }

    pub fn with_processing_started_time(mut self, at: DateTime<Utc>) -> Self {
        self.processing_started_time = Some(at);
        self
    }
}

impl From<&JobRecord> for JobRecordPatch {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            server_job_id: Some(record.server_job_id.clone()),
            job_body: Some(record.job_body.clone()),
            status: Some(StatusChange {
                status: record.job_status,
                retry_count: record.retry_count,
            }),
            created_time: Some(record.created_time),
            updated_time: record.updated_time,
            processing_started_time: Some(record.processing_started_time),
        }
    }
}
