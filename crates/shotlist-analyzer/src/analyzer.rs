//! The analysis capability consumed by the job queue.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use shotlist_models::{Job, Shot};
use tracing::{debug, info};

use crate::error::{AnalyzerError, AnalyzerResult};
use crate::protocol::{Request, Response};
use crate::supervisor::{WorkerRole, WorkerSupervisor};

/// Shot detection and description.
///
/// The queue only ever has one call in flight, so implementations do not
/// need to handle overlapping requests.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Find shot boundaries in the job's input and write a screenshot per shot
    /// into the job's output directory. An empty list is a valid result.
    async fn detect(&self, job: &Job) -> AnalyzerResult<Vec<Shot>>;

    /// Fill in descriptions for every shot in the record at `record_path`.
    ///
    /// The worker updates the record in place as it goes; a successful
    /// return means it has finished with the record.
    async fn describe_and_finalize(&self, record_path: &Path) -> AnalyzerResult<()>;
}

/// [`Analyzer`] backed by supervised worker processes.
pub struct ProcessAnalyzer {
    supervisor: Arc<WorkerSupervisor>,
}

impl ProcessAnalyzer {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    async fn call(&self, role: WorkerRole, request: Request) -> AnalyzerResult<Response> {
        let handle = self.supervisor.acquire(role).await?;
        debug!(role = %role, pid = ?handle.pid(), opcode = request.opcode(), "Dispatching to worker");
        self.supervisor.send(&handle, request).await
    }
}

#[async_trait]
impl Analyzer for ProcessAnalyzer {
    async fn detect(&self, job: &Job) -> AnalyzerResult<Vec<Shot>> {
        let request = Request::detect(job.input_path(), job.id.clone(), job.output_dir());
        match self.call(self.supervisor.detection_role(), request).await? {
            Response::DetectDone(shots) => {
                info!(job_id = %job.id, shots = shots.len(), "Detection finished");
                Ok(shots)
            }
            other => Err(AnalyzerError::protocol(format!(
                "expected DETECT_DONE, got {}",
                other.kind()
            ))),
        }
    }

    async fn describe_and_finalize(&self, record_path: &Path) -> AnalyzerResult<()> {
        match self
            .call(WorkerRole::Vision, Request::describe(record_path))
            .await?
        {
            Response::Done(echo) => {
                debug!(record = %record_path.display(), echo = %echo, "Descriptions finished");
                Ok(())
            }
            other => Err(AnalyzerError::protocol(format!(
                "expected DONE, got {}",
                other.kind()
            ))),
        }
    }
}
