//! `jobwarden-core` — job lifecycle domain building blocks.
//!
//! This crate contains **pure domain** logic (no I/O): the job record and its
//! status machine, the codec that maps records onto store items, and the
//! envelope codec that correlates queue deliveries with records.

pub mod envelope;
pub mod error;
pub mod id;
pub mod job;
pub mod record;

pub use envelope::{decode_envelope, encode_envelope, JobEnvelope};
pub use error::{ErrorCategory, JobError};
pub use id::ServerJobId;
pub use job::{validate_transition, zero_time, JobRecord, JobRecordPatch, JobStatus, StatusChange};
pub use record::{
    from_store_read, to_partial_store_write, to_store_write, AttributeValue, CreateItem, Item,
    UpsertItem, WriteCondition,
};
