//! Request and response records for the orchestrator operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwarden_core::{JobRecord, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub job_id: String,
    pub job_body: String,
    /// Record retention; negative values are rejected.
    pub ttl: Option<chrono::Duration>,
}

impl SubmitRequest {
    pub fn new(job_id: impl Into<String>, job_body: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_body: job_body.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job: JobRecord,
}

/// Result of claiming the head of the queue.
///
/// `job` is `None` when the delivery could not be matched to a record within
/// the retry budget: the message is dangling and the caller should delete it
/// (see `delete_orphaned_job_message`) and move on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimNextResponse {
    pub job_id: String,
    pub receipt_info: String,
    pub job: Option<JobRecord>,
}

impl ClaimNextResponse {
    pub fn is_orphaned(&self) -> bool {
        self.job.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetJobRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBodyRequest {
    pub job_id: String,
    pub job_body: String,
    /// The `updated_time` the caller last observed.
    pub known_updated_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBodyResponse {
    pub updated_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatusRequest {
    pub job_id: String,
    pub job_status: JobStatus,
    /// Required for SUCCESS and FAILURE so the delivery can be deleted.
    pub receipt_info: Option<String>,
    /// The `updated_time` the caller last observed.
    pub known_updated_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub job_status: JobStatus,
    pub updated_time: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendVisibilityRequest {
    pub job_id: String,
    pub duration: chrono::Duration,
    pub receipt_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOrphanedJobMessageRequest {
    pub job_id: String,
    pub receipt_info: String,
}
