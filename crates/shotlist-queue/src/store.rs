//! File-backed progress store.
//!
//! One JSON record per job at `<data_dir>/<job_id>/<record_file>`. Writes
//! go to a temp file in the same directory and are renamed over the old
//! record, so readers see either the old or the new record in full.
//!
//! The description worker rewrites the same file in place while it runs,
//! which is why reads retry a record that fails to parse.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use shotlist_models::{JobId, ProgressRecord};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct ProgressStore {
    config: QueueConfig,
}

impl ProgressStore {
    /// Store rooted at `config.data_dir`, resolved against the current directory.
    ///
    /// Record and output paths are handed to worker processes, which may run
    /// in a different working directory.
    pub fn new(mut config: QueueConfig) -> Self {
        match std::path::absolute(&config.data_dir) {
            Ok(dir) => config.data_dir = dir,
            Err(e) => warn!(
                data_dir = %config.data_dir.display(),
                "Could not resolve data directory: {}", e
            ),
        }
        Self { config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Output directory of a job: screenshots, record and report.
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.config.data_dir.join(job_id.as_str())
    }

    pub fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join(&self.config.record_file)
    }

    /// Persist the full record, replacing any previous one.
    pub async fn write(&self, record: &ProgressRecord) -> StoreResult<()> {
        let path = self.record_path(&record.job_id);
        if record.queue_position.is_some() {
            let mut stored = record.clone();
            stored.queue_position = None;
            write_json_atomic(&path, &stored).await
        } else {
            write_json_atomic(&path, record).await
        }
    }

    /// Last written record, `None` if the job was never written.
    pub async fn read(&self, job_id: &JobId) -> StoreResult<Option<ProgressRecord>> {
        let path = self.record_path(job_id);
        let mut attempt = 0;
        loop {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<ProgressRecord>(&bytes) {
                Ok(mut record) => {
                    // Records written by hand or by older runs may lack the id.
                    record.job_id = job_id.clone();
                    return Ok(Some(record));
                }
                Err(e) if attempt < self.config.read_retries => {
                    attempt += 1;
                    debug!(job_id = %job_id, attempt, "Record did not parse, retrying: {}", e);
                    tokio::time::sleep(self.config.read_retry_delay).await;
                }
                Err(e) => {
                    warn!(job_id = %job_id, "Record is unreadable: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Remove the job directory. Returns whether anything was there.
    pub async fn delete(&self, job_id: &JobId) -> StoreResult<bool> {
        match tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every job directory holding a record.
    pub async fn list(&self) -> StoreResult<Vec<JobId>> {
        let mut entries = match tokio::fs::read_dir(&self.config.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let id = JobId::from(name);
            if !id.is_valid() {
                continue;
            }
            if tokio::fs::try_exists(self.record_path(&id)).await.unwrap_or(false) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> StoreResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Persist(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| StoreError::Persist(format!("{}: {}", path.display(), e.error)))?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}
