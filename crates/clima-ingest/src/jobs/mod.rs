//! Durable job-state store
//!
//! One row per `(dataset, file)` in `file_processing_log` is the single
//! source of truth for who owns a file. Jobs move through
//!
//! ```text
//! pending --claim--> processing --success--> completed
//!                        |
//!                        +--failure, retries left--> pending
//!                        +--failure, retries spent--> failed
//! ```
//!
//! and every move is one `BEGIN IMMEDIATE` transaction, so concurrent
//! claimants in separate processes never both win the same row. Jobs left
//! in `processing` by a crashed worker are returned to `pending` by the
//! stale sweep once `claim_timeout` has passed.

mod store;
mod tx;
mod types;

pub use store::{JobStore, MAX_ERROR_MESSAGE_CHARS};
pub use types::{
    DatabaseStats, DatasetMetadata, JobRecord, JobStatus, JobStoreConfig, ProcessingStats,
    ProcessingSummary, SweepReport, WorkerSession, WorkerStats,
};
