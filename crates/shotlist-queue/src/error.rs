//! Queue error types.

use shotlist_analyzer::AnalyzerError;
use shotlist_models::TransitionError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Progress store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Atomic replace failed: {0}")]
    Persist(String),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("Progress store error: {0}")]
    Store(#[from] StoreError),

    #[error("Report assembly failed: {0}")]
    Finalize(String),

    #[error("{0}")]
    Transition(#[from] TransitionError),

    #[error("Job is in progress: {0}")]
    Conflict(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Queue is shutting down")]
    ShuttingDown,
}

impl QueueError {
    pub fn finalize(msg: impl Into<String>) -> Self {
        Self::Finalize(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }
}
