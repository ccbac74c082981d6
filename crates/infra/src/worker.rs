//! Background worker driving claimed jobs through the lifecycle.
//!
//! Each iteration claims the head of the queue and either cleans up an
//! orphaned delivery or runs the registered [`JobHandler`]:
//!
//! ```text
//! claim_next ──► none ──────────────► sleep(poll_interval)
//!            ├─► orphaned / finished ─► delete_orphaned_job_message
//!            └─► active ─► PROCESSING ─► handler ─► SUCCESS | FAILURE
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobwarden_core::{JobError, JobRecord, JobStatus};

use crate::orchestrator::{
    ClaimNextResponse, DeleteOrphanedJobMessageRequest, JobOrchestrator, UpdateStatusRequest,
};
use crate::queue::JobQueue;
use crate::store::JobStore;

/// Application code run for each claimed job.
///
/// An `Err` marks the job FAILURE; the error is logged, not stored.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()>;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How long to sleep when the queue is empty or a claim failed
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// What a single worker iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// No visible message.
    Idle,
    /// A dangling or already finished delivery was deleted.
    Orphaned { job_id: String },
    Succeeded { job_id: String },
    Failed { job_id: String },
}

/// Counters shared between a running worker and its handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    orphaned: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub orphaned: u64,
    pub errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &WorkOutcome) {
        let counter = match outcome {
            WorkOutcome::Idle => return,
            WorkOutcome::Orphaned { .. } => &self.orphaned,
            WorkOutcome::Succeeded { .. } => &self.succeeded,
            WorkOutcome::Failed { .. } => &self.failed,
        };
        self.claimed.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to control a spawned worker.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the worker once its current iteration ends.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<WorkerStats>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown and wait for the current iteration to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "worker task ended abnormally");
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Claims jobs and runs them through a [`JobHandler`].
pub struct JobWorker<Q, S> {
    orchestrator: Arc<JobOrchestrator<Q, S>>,
    handler: Arc<dyn JobHandler>,
    config: JobWorkerConfig,
    stats: Arc<WorkerStats>,
}

impl<Q, S> JobWorker<Q, S>
where
    Q: JobQueue + 'static,
    S: JobStore + 'static,
{
    pub fn new(
        orchestrator: Arc<JobOrchestrator<Q, S>>,
        handler: Arc<dyn JobHandler>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            handler,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one claim/process iteration.
    pub async fn run_once(&self) -> Result<WorkOutcome, JobError> {
        let Some(claim) = self.orchestrator.claim_next().await? else {
            return Ok(WorkOutcome::Idle);
        };

        let outcome = match &claim.job {
            Some(job) if job.job_status.is_active() => self.process(job, &claim).await?,
            _ => self.discard(&claim).await?,
        };
        self.stats.record(&outcome);
        Ok(outcome)
    }

    async fn discard(&self, claim: &ClaimNextResponse) -> Result<WorkOutcome, JobError> {
        debug!(job_id = %claim.job_id, "discarding orphaned or finished delivery");
        self.orchestrator
            .delete_orphaned_job_message(DeleteOrphanedJobMessageRequest {
                job_id: claim.job_id.clone(),
                receipt_info: claim.receipt_info.clone(),
            })
            .await?;
        Ok(WorkOutcome::Orphaned {
            job_id: claim.job_id.clone(),
        })
    }

    async fn process(
        &self,
        job: &JobRecord,
        claim: &ClaimNextResponse,
    ) -> Result<WorkOutcome, JobError> {
        let started = self
            .orchestrator
            .update_status(UpdateStatusRequest {
                job_id: job.job_id.clone(),
                job_status: JobStatus::Processing,
                receipt_info: Some(claim.receipt_info.clone()),
                known_updated_time: job.updated_time,
            })
            .await?;

        let mut running = job.clone();
        running.job_status = started.job_status;
        running.updated_time = started.updated_time;
        running.processing_started_time = started.updated_time;
        running.retry_count = started.retry_count;

        let (status, outcome) = match self.handler.handle(&running).await {
            Ok(()) => (
                JobStatus::Success,
                WorkOutcome::Succeeded {
                    job_id: job.job_id.clone(),
                },
            ),
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "job handler failed");
                (
                    JobStatus::Failure,
                    WorkOutcome::Failed {
                        job_id: job.job_id.clone(),
                    },
                )
            }
        };

        self.orchestrator
            .update_status(UpdateStatusRequest {
                job_id: job.job_id.clone(),
                job_status: status,
                receipt_info: Some(claim.receipt_info.clone()),
                known_updated_time: started.updated_time,
            })
            .await?;
        Ok(outcome)
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn(self) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));

        JobWorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "job worker started");

        while !stop_requested(&shutdown) {
            let idle = match self.run_once().await {
                Ok(WorkOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(worker = %self.config.name, ?outcome, "iteration finished");
                    false
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %self.config.name, error = %e, "iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker = %self.config.name, stats = ?self.stats.snapshot(), "job worker stopped");
    }
}

/// A dropped sender counts as a shutdown request.
fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::{GetJobRequest, SubmitRequest};
    use crate::queue::{InMemoryJobQueue, QueueError, QueueMessage};
    use crate::store::InMemoryJobStore;
    use crate::translator::InMemoryStatusTranslator;

    struct FailOn(&'static str);

    #[async_trait]
    impl JobHandler for FailOn {
        async fn handle(&self, job: &JobRecord) -> anyhow::Result<()> {
            assert_eq!(job.job_status, JobStatus::Processing);
            if job.job_body == self.0 {
                anyhow::bail!("refusing body {}", job.job_body);
            }
            Ok(())
        }
    }

    type Orchestrator = JobOrchestrator<Arc<InMemoryJobQueue>, Arc<InMemoryJobStore>>;

    fn worker(handler: impl JobHandler + 'static) -> (Arc<Orchestrator>, JobWorker<Arc<InMemoryJobQueue>, Arc<InMemoryJobStore>>) {
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(InMemoryJobQueue::new()),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryStatusTranslator),
            OrchestratorConfig::default(),
        ));
        let worker = JobWorker::new(
            orchestrator.clone(),
            Arc::new(handler),
            JobWorkerConfig::default().with_poll_interval(Duration::from_millis(10)),
        );
        (orchestrator, worker)
    }

    async fn status_of(orchestrator: &Orchestrator, job_id: &str) -> JobStatus {
        orchestrator
            .get_by_id(GetJobRequest {
                job_id: job_id.to_string(),
            })
            .await
            .unwrap()
            .job_status
    }

    #[tokio::test]
    async fn run_once_processes_jobs_to_terminal_states() {
        let (orchestrator, worker) = worker(FailOn("bad"));
        orchestrator.submit(SubmitRequest::new("ok", "good")).await.unwrap();
        orchestrator.submit(SubmitRequest::new("ko", "bad")).await.unwrap();

        assert_eq!(
            worker.run_once().await.unwrap(),
            WorkOutcome::Succeeded { job_id: "ok".into() }
        );
        assert_eq!(
            worker.run_once().await.unwrap(),
            WorkOutcome::Failed { job_id: "ko".into() }
        );
        assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Idle);

        assert_eq!(status_of(&orchestrator, "ok").await, JobStatus::Success);
        assert_eq!(status_of(&orchestrator, "ko").await, JobStatus::Failure);
        assert!(orchestrator.queue().is_empty());

        let stats = worker.stats();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dangling_messages_are_discarded() {
        let (orchestrator, worker) = worker(FailOn("bad"));
        orchestrator
            .queue()
            .enqueue(jobwarden_core::encode_envelope("ghost", "nobody").unwrap())
            .await
            .unwrap();

        assert_eq!(
            worker.run_once().await.unwrap(),
            WorkOutcome::Orphaned { job_id: "ghost".into() }
        );
        assert!(orchestrator.queue().is_empty());
        assert_eq!(worker.stats().orphaned, 1);
    }

    #[test]
    fn stats_snapshot_serializes_flat() {
        let stats = WorkerStats::default();
        stats.record(&WorkOutcome::Succeeded { job_id: "a".into() });
        stats.record(&WorkOutcome::Orphaned { job_id: "b".into() });
        stats.record(&WorkOutcome::Idle);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "claimed": 2,
                "succeeded": 1,
                "failed": 0,
                "orphaned": 1,
                "errors": 0
            })
        );
    }

    #[tokio::test]
    async fn spawned_worker_drains_queue_and_shuts_down() {
        let (orchestrator, worker) = worker(FailOn("bad"));
        for i in 0..3 {
            orchestrator
                .submit(SubmitRequest::new(format!("job-{i}"), "good"))
                .await
                .unwrap();
        }

        let handle = worker.spawn();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().succeeded < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;

        for i in 0..3 {
            assert_eq!(
                status_of(&orchestrator, &format!("job-{i}")).await,
                JobStatus::Success
            );
        }
    }

    /// Counts claim attempts against an empty in-memory queue.
    #[derive(Default)]
    struct CountingQueue {
        inner: InMemoryJobQueue,
        claims: AtomicU64,
    }

    #[async_trait]
    impl JobQueue for CountingQueue {
        async fn enqueue(&self, body: Vec<u8>) -> Result<(), QueueError> {
            self.inner.enqueue(body).await
        }

        async fn claim_head(&self) -> Result<Option<QueueMessage>, QueueError> {
            self.claims.fetch_add(1, Ordering::Relaxed);
            self.inner.claim_head().await
        }

        async fn extend_visibility(
            &self,
            receipt_info: &str,
            duration: Duration,
        ) -> Result<(), QueueError> {
            self.inner.extend_visibility(receipt_info, duration).await
        }

        async fn delete(&self, receipt_info: &str) -> Result<(), QueueError> {
            self.inner.delete(receipt_info).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_handle_stops_the_worker() {
        let queue = Arc::new(CountingQueue::default());
        let orchestrator = Arc::new(JobOrchestrator::new(
            queue.clone(),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryStatusTranslator),
            OrchestratorConfig::default(),
        ));
        let worker = JobWorker::new(
            orchestrator,
            Arc::new(FailOn("bad")),
            JobWorkerConfig::default().with_poll_interval(Duration::from_millis(500)),
        );

        let handle = worker.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = queue.claims.load(Ordering::Relaxed);
        assert!(settled <= 2, "worker kept claiming: {settled} claims");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.claims.load(Ordering::Relaxed), settled);
    }
}
