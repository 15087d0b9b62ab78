//! Job admission queue for shot-list analysis.
//!
//! This crate provides:
//! - A single-slot FIFO that runs one job at a time through detect, describe and finalize
//! - Idempotent submission keyed by job id
//! - A file-backed progress store with atomic record replacement
//! - Report assembly once a job's shots are described

pub mod config;
pub mod error;
pub mod finalize;
pub mod logging;
pub mod queue;
pub mod store;

pub use config::QueueConfig;
pub use error::{QueueError, QueueResult, StoreError, StoreResult};
pub use finalize::{Finalizer, ReportWriter};
pub use logging::JobLogger;
pub use queue::{JobQueue, QueueSnapshot, SubmitOutcome};
pub use store::ProgressStore;
