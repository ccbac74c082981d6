//! Job orchestrator: the operations that move a job through its lifecycle.
//!
//! The store is the system of record and the queue only dispatches. Every
//! operation is a short, strictly ordered chain of collaborator calls; the
//! orchestrator holds no shared mutable state of its own. Concurrent writers
//! to one job are serialized by the `updated_time` fence plus a conditional
//! write, so the loser of a race sees `UpdationConflict`.

pub mod types;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use jobwarden_core::{
    decode_envelope, encode_envelope, from_store_read, to_partial_store_write, to_store_write,
    validate_transition, zero_time, JobError, JobRecord, JobRecordPatch, JobStatus, ServerJobId,
    WriteCondition,
};

use crate::config::OrchestratorConfig;
use crate::dispatcher::{DispatchError, RetryDispatcher};
use crate::queue::{JobQueue, QueueError};
use crate::store::{JobStore, StoreError};
use crate::translator::StatusTranslator;

pub use types::*;

/// Coordinates a [`JobQueue`] and a [`JobStore`] to run the job lifecycle.
pub struct JobOrchestrator<Q, S> {
    queue: Q,
    store: S,
    translator: Arc<dyn StatusTranslator>,
    dispatcher: RetryDispatcher,
    config: OrchestratorConfig,
}

impl<Q, S> JobOrchestrator<Q, S>
where
    Q: JobQueue,
    S: JobStore,
{
    pub fn new(
        queue: Q,
        store: S,
        translator: Arc<dyn StatusTranslator>,
        config: OrchestratorConfig,
    ) -> Self {
        let dispatcher = RetryDispatcher::new(config.claim_retry.clone());
        Self {
            queue,
            store,
            translator,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a new job and write its CREATED record.
    ///
    /// The envelope is enqueued before the record is written, so a failed
    /// write leaves a dangling message behind; `claim_next` reports it as
    /// orphaned once its retry budget runs out.
    #[instrument(skip(self, request), fields(job_id = %request.job_id), err)]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, JobError> {
        if request.job_id.is_empty() {
            return Err(JobError::MissingJobId);
        }

        let server_job_id = ServerJobId::new().to_string();
        let record = JobRecord::created(
            request.job_id.as_str(),
            server_job_id.as_str(),
            request.job_body,
            Utc::now(),
        );
        let write = to_store_write(&self.config.table_name, &record, request.ttl)?;

        let envelope = encode_envelope(&record.job_id, &server_job_id)?;
        self.queue.enqueue(envelope).await.map_err(queue_error)?;

        if let Err(err) = self.store.create_if_absent(write).await {
            if self.translator.is_already_exists(&err.code) {
                warn!(error = %err, "job already exists, enqueued message is orphaned");
                return Err(JobError::DuplicateJobEntry(record.job_id));
            }
            return Err(JobError::JobEntryCreationFailed(err.to_string()));
        }

        info!(server_job_id = %server_job_id, "job submitted");
        Ok(SubmitResponse { job: record })
    }

    /// Claim the head of the queue and match it to its record.
    ///
    /// Returns `Ok(None)` when no message is visible. A delivery whose record
    /// cannot be found (or whose fencing token no longer matches) within the
    /// retry budget comes back as an orphaned response with `job: None`.
    #[instrument(skip(self), fields(job_id = tracing::field::Empty), err)]
    pub async fn claim_next(&self) -> Result<Option<ClaimNextResponse>, JobError> {
        let Some(message) = self.queue.claim_head().await.map_err(queue_error)? else {
            return Ok(None);
        };

        let (job_id, server_job_id) = decode_envelope(&message.message_body)?;
        tracing::Span::current().record("job_id", job_id.as_str());

        let outcome = {
            let job_id = job_id.as_str();
            let server_job_id = server_job_id.as_str();
            self.dispatcher
                .dispatch(move |attempt| {
                    debug!(attempt, "matching delivery to record");
                    self.read_matching(job_id, server_job_id)
                })
                .await
        };

        match outcome {
            Ok(record) => Ok(Some(ClaimNextResponse {
                job_id,
                receipt_info: message.receipt_info,
                job: Some(record),
            })),
            Err(DispatchError::RetriesExhausted { attempts }) => {
                warn!(attempts, "no matching record for delivery, reporting it as orphaned");
                Ok(Some(ClaimNextResponse {
                    job_id,
                    receipt_info: message.receipt_info,
                    job: None,
                }))
            }
            Err(DispatchError::Failed(err)) => Err(err),
        }
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id), err)]
    pub async fn get_by_id(&self, request: GetJobRequest) -> Result<JobRecord, JobError> {
        if request.job_id.is_empty() {
            return Err(JobError::MissingJobId);
        }
        self.read_record(&request.job_id).await
    }

    /// Replace the job body, fenced on the caller's last observed
    /// `updated_time`.
    #[instrument(skip(self, request), fields(job_id = %request.job_id), err)]
    pub async fn update_body(
        &self,
        request: UpdateBodyRequest,
    ) -> Result<UpdateBodyResponse, JobError> {
        if request.job_id.is_empty() {
            return Err(JobError::MissingJobId);
        }

        let current = self.read_record(&request.job_id).await?;
        check_fence(&current, request.known_updated_time)?;

        let updated_time = next_updated_time(current.updated_time);
        let patch = JobRecordPatch::new(request.job_id.as_str(), updated_time)
            .with_body(request.job_body);
        self.write_patch(&patch, current.updated_time).await?;

        Ok(UpdateBodyResponse { updated_time })
    }

    /// Move the job to `job_status`.
    ///
    /// Entering CREATED or PROCESSING counts as a retry, including
    /// re-entering the current status. Terminal transitions delete the
    /// delivery after the record is written; a failed delete is reported as
    /// this operation's failure even though the record is already terminal.
    #[instrument(
        skip(self, request),
        fields(job_id = %request.job_id, job_status = %request.job_status),
        err
    )]
    pub async fn update_status(
        &self,
        request: UpdateStatusRequest,
    ) -> Result<UpdateStatusResponse, JobError> {
        if request.job_id.is_empty() {
            return Err(JobError::MissingJobId);
        }
        let receipt = match request.receipt_info.as_deref() {
            Some(receipt) if !receipt.is_empty() => Some(receipt),
            _ if request.job_status.is_terminal() => return Err(JobError::InvalidReceiptInfo),
            _ => None,
        };

        let current = self.read_record(&request.job_id).await?;
        check_fence(&current, request.known_updated_time)?;
        validate_transition(current.job_status, request.job_status)?;

        let now = next_updated_time(current.updated_time);
        let mut patch = JobRecordPatch::new(request.job_id.as_str(), now);
        let retry_count = match request.job_status {
            JobStatus::Created => {
                patch = patch.with_processing_started_time(zero_time());
                current.retry_count.saturating_add(1)
            }
            JobStatus::Processing => {
                patch = patch.with_processing_started_time(now);
                current.retry_count.saturating_add(1)
            }
            _ => current.retry_count,
        };
        patch = patch.with_status(request.job_status, retry_count);
        self.write_patch(&patch, current.updated_time).await?;

        if request.job_status.is_terminal() {
            if let Some(receipt) = receipt {
                self.queue.delete(receipt).await.map_err(|err| {
                    warn!(error = %err, "record is terminal but the delivery was not deleted");
                    queue_error(err)
                })?;
            }
        }

        debug!(from = %current.job_status, retry_count, "status updated");
        Ok(UpdateStatusResponse {
            job_status: request.job_status,
            updated_time: now,
            retry_count,
        })
    }

    /// Keep a claimed delivery hidden for `duration` from now.
    #[instrument(skip(self, request), fields(job_id = %request.job_id), err)]
    pub async fn extend_visibility(&self, request: ExtendVisibilityRequest) -> Result<(), JobError> {
        if request.job_id.is_empty() {
            return Err(JobError::MissingJobId);
        }

        let max = self.config.max_visibility_timeout;
        let duration = request.duration.to_std().map_err(|_| {
            JobError::invalid_duration(format!(
                "{}ms is negative",
                request.duration.num_milliseconds()
            ))
        })?;
        if duration > max {
            return Err(JobError::invalid_duration(format!(
                "{}ms exceeds the maximum of {}ms",
                duration.as_millis(),
                max.as_millis()
            )));
        }
        if request.receipt_info.is_empty() {
            return Err(JobError::InvalidReceiptInfo);
        }

        self.queue
            .extend_visibility(&request.receipt_info, duration)
            .await
            .map_err(queue_error)
    }

    /// Delete a delivery whose job is gone or already finished.
    ///
    /// Fails with `InvalidJobStatus` and keeps the message when the job is
    /// still CREATED or PROCESSING.
    #[instrument(skip(self, request), fields(job_id = %request.job_id), err)]
    pub async fn delete_orphaned_job_message(
        &self,
        request: DeleteOrphanedJobMessageRequest,
    ) -> Result<(), JobError> {
        if request.job_id.is_empty() {
            return Err(JobError::MissingJobId);
        }
        if request.receipt_info.is_empty() {
            return Err(JobError::InvalidReceiptInfo);
        }

        match self.read_record(&request.job_id).await {
            Ok(record) if record.job_status.is_active() => {
                return Err(JobError::invalid_status(format!(
                    "job is still {}, message kept",
                    record.job_status
                )));
            }
            Ok(record) => debug!(job_status = %record.job_status, "job is finished"),
            Err(JobError::RecordNotFound(_)) => debug!("job has no record"),
            Err(err) => return Err(err),
        }

        self.queue
            .delete(&request.receipt_info)
            .await
            .map_err(queue_error)?;
        info!("orphaned message deleted");
        Ok(())
    }

    async fn read_record(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let item = self
            .store
            .get(&self.config.table_name, job_id)
            .await
            .map_err(|err| self.read_error(job_id, err))?;
        from_store_read(&item)
    }

    /// Read the record and require the delivery's fencing token.
    ///
    /// A mismatch means the delivery is stale and counts as not found.
    async fn read_matching(&self, job_id: &str, server_job_id: &str) -> Result<JobRecord, JobError> {
        let record = self.read_record(job_id).await?;
        if record.server_job_id != server_job_id {
            return Err(JobError::not_found(format!(
                "{job_id} (server job id {server_job_id} superseded by {})",
                record.server_job_id
            )));
        }
        Ok(record)
    }

    async fn write_patch(
        &self,
        patch: &JobRecordPatch,
        observed: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let write = to_partial_store_write(&self.config.table_name, patch)
            .with_condition(WriteCondition::updated_time_is(observed));

        self.store.upsert_partial(write).await.map_err(|err| {
            if self.translator.is_condition_failed(&err.code) {
                JobError::conflict(format!("{} was modified concurrently", patch.job_id))
            } else if self.translator.is_not_found(&err.code) {
                JobError::not_found(patch.job_id.as_str())
            } else {
                JobError::Store(err.to_string())
            }
        })
    }

    fn read_error(&self, job_id: &str, err: StoreError) -> JobError {
        if self.translator.is_not_found(&err.code) {
            JobError::not_found(job_id)
        } else {
            JobError::Store(err.to_string())
        }
    }
}

/// Reject callers that observed an older version than the stored one.
fn check_fence(current: &JobRecord, known: DateTime<Utc>) -> Result<(), JobError> {
    if current.updated_time > known {
        return Err(JobError::conflict(format!(
            "{} was updated at {}, caller observed {}",
            current.job_id, current.updated_time, known
        )));
    }
    Ok(())
}

/// A fresh `updated_time`, strictly after the stored one even under clock skew.
fn next_updated_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::nanoseconds(1)
    }
}

fn queue_error(err: QueueError) -> JobError {
    JobError::Queue(err.to_string())
}
