//! Record store boundary.
//!
//! The store is the system of record: one item per job, keyed by `job_id`.
//! Implementations must provide per-key atomicity for conditional creates
//! and conditional partial updates; the orchestrator takes no locks of its
//! own.
//!
//! Failures carry the backend's own status code. Interpreting those codes
//! ("already exists", "not found", "condition failed") is the job of a
//! [`StatusTranslator`](crate::translator::StatusTranslator), never of the
//! orchestrator.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use jobwarden_core::{CreateItem, Item, UpsertItem};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Store operation error with the backend-specific status code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct StoreError {
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Keyed item store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a new item; fails if an item with the same key exists.
    async fn create_if_absent(&self, request: CreateItem) -> Result<(), StoreError>;

    /// Read the item stored under `key`.
    async fn get(&self, table_name: &str, key: &str) -> Result<Item, StoreError>;

    /// Merge the given attributes into the item under `key`, creating it if
    /// absent. When a condition is set, the item must exist and satisfy it.
    async fn upsert_partial(&self, request: UpsertItem) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_if_absent(&self, request: CreateItem) -> Result<(), StoreError> {
        (**self).create_if_absent(request).await
    }

    async fn get(&self, table_name: &str, key: &str) -> Result<Item, StoreError> {
        (**self).get(table_name, key).await
    }

    async fn upsert_partial(&self, request: UpsertItem) -> Result<(), StoreError> {
        (**self).upsert_partial(request).await
    }
}
