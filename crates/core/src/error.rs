//! Job lifecycle error model.

use thiserror::Error;

/// Job lifecycle error.
///
/// Every operation resolves to one of these variants. Backend failures are
/// carried as strings so the taxonomy stays independent of any concrete
/// queue or store driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The request carried an empty `job_id`.
    #[error("missing job id")]
    MissingJobId,

    /// The request carried no usable queue receipt.
    #[error("invalid receipt info")]
    InvalidReceiptInfo,

    /// The requested record TTL was negative.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    /// A visibility duration was outside `[0, max_visibility_timeout]`.
    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    /// The caller observed a stale `updated_time` (lost a write race).
    #[error("updation conflict: {0}")]
    UpdationConflict(String),

    /// A record with the same `job_id` already exists.
    #[error("duplicate job entry: {0}")]
    DuplicateJobEntry(String),

    /// The store rejected the initial record write for a reason other than a duplicate.
    #[error("job entry creation failed: {0}")]
    JobEntryCreationFailed(String),

    /// No record (or no record matching the delivery's fencing token) exists.
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// A stored item is missing attributes or has malformed values.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// A status was unparseable or the requested transition is not allowed.
    #[error("invalid job status: {0}")]
    InvalidJobStatus(String),

    /// A queue message body could not be decoded.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The record store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The message queue failed.
    #[error("queue error: {0}")]
    Queue(String),
}

/// Coarse classification of [`JobError`] variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller mistake; never retried.
    Validation,
    /// Race lost against another writer; re-read and retry.
    Conflict,
    /// Corrupt or drifted stored data; fatal for that read.
    Data,
    /// The record is not (yet) visible.
    NotFound,
    /// Queue or store unavailability.
    Collaborator,
}

impl JobError {
    pub fn invalid_ttl(msg: impl Into<String>) -> Self {
        Self::InvalidTtl(msg.into())
    }

    pub fn invalid_duration(msg: impl Into<String>) -> Self {
        Self::InvalidDuration(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::UpdationConflict(msg.into())
    }

    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self::RecordNotFound(job_id.into())
    }

    pub fn invalid_item(msg: impl Into<String>) -> Self {
        Self::InvalidItem(msg.into())
    }

    pub fn invalid_status(msg: impl Into<String>) -> Self {
        Self::InvalidJobStatus(msg.into())
    }

    pub fn invalid_envelope(msg: impl Into<String>) -> Self {
        Self::InvalidEnvelope(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::MissingJobId
            | JobError::InvalidReceiptInfo
            | JobError::InvalidTtl(_)
            | JobError::InvalidDuration(_) => ErrorCategory::Validation,
            JobError::UpdationConflict(_) | JobError::DuplicateJobEntry(_) => {
                ErrorCategory::Conflict
            }
            JobError::InvalidItem(_)
            | JobError::InvalidJobStatus(_)
            | JobError::InvalidEnvelope(_) => ErrorCategory::Data,
            JobError::RecordNotFound(_) => ErrorCategory::NotFound,
            JobError::JobEntryCreationFailed(_) | JobError::Store(_) | JobError::Queue(_) => {
                ErrorCategory::Collaborator
            }
        }
    }

    /// Only a not-found read may be retried by the claim repair loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::RecordNotFound(_))
    }
}
