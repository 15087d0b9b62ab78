//! Analyzer error types.

use thiserror::Error;

pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker not ready after {0} seconds")]
    StartupTimeout(u64),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("No response from worker after {0} seconds")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalyzerError {
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        Self::WorkerCrashed(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// The worker process itself is gone or unusable and has been discarded.
    ///
    /// Protocol errors are not in this set: a bad payload does not mean a bad process.
    pub fn is_worker_fault(&self) -> bool {
        matches!(
            self,
            AnalyzerError::SpawnFailed(_)
                | AnalyzerError::StartupTimeout(_)
                | AnalyzerError::WorkerCrashed(_)
                | AnalyzerError::Timeout(_)
        )
    }
}
