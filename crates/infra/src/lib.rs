//! Infrastructure layer: queue and store backends, the job orchestrator,
//! the claim retry dispatcher, configuration and the background worker.

pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod translator;
pub mod worker;


pub use config::{ConfigError, OrchestratorConfig};
pub use dispatcher::{BackoffStrategy, DispatchError, RetryDispatcher, RetryPolicy, Retryable};
pub use orchestrator::JobOrchestrator;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, QueueMessage};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
pub use translator::{InMemoryStatusTranslator, PostgresStatusTranslator, StatusTranslator};
pub use worker::{JobHandler, JobWorker, JobWorkerConfig, JobWorkerHandle, WorkOutcome, WorkerStatsSnapshot};
