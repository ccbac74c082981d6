//! Backend status-code translation.
//!
//! Backends signal "already exists", "not found" and "condition failed" in
//! their own vocabulary. One [`StatusTranslator`] per backend maps those codes
//! onto the job error taxonomy, so the orchestrator never branches on backend
//! identity.

use std::fmt;

use crate::store::{in_memory, postgres};

/// Strategy mapping backend-specific store codes onto outcomes.
pub trait StatusTranslator: Send + Sync + fmt::Debug {
    fn is_already_exists(&self, code: &str) -> bool;

    fn is_not_found(&self, code: &str) -> bool;

    fn is_condition_failed(&self, code: &str) -> bool;
}

/// Codes reported by [`InMemoryJobStore`](crate::store::InMemoryJobStore).
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryStatusTranslator;

impl StatusTranslator for InMemoryStatusTranslator {
    fn is_already_exists(&self, code: &str) -> bool {
        code == in_memory::codes::ALREADY_EXISTS
    }

    fn is_not_found(&self, code: &str) -> bool {
        code == in_memory::codes::NOT_FOUND
    }

    fn is_condition_failed(&self, code: &str) -> bool {
        code == in_memory::codes::CONDITION_FAILED
    }
}

/// Codes reported by [`PostgresJobStore`](crate::store::PostgresJobStore).
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresStatusTranslator;

impl StatusTranslator for PostgresStatusTranslator {
    fn is_already_exists(&self, code: &str) -> bool {
        code == postgres::codes::UNIQUE_VIOLATION
    }

    fn is_not_found(&self, code: &str) -> bool {
        code == postgres::codes::ROW_NOT_FOUND
    }

    fn is_condition_failed(&self, code: &str) -> bool {
        code == postgres::codes::CONDITION_FAILED
    }
}
