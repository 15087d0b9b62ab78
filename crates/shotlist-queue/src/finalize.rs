//! Report assembly, run once per job after descriptions.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shotlist_models::{Job, ProgressRecord};

use crate::error::{QueueError, QueueResult};
use crate::store::write_json_atomic;

/// Builds the downloadable report from a fully described record.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Assemble the report and return where it was written.
    async fn finalize(&self, job: &Job, record: &ProgressRecord) -> QueueResult<PathBuf>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    job_id: &'a str,
    title: Option<&'a str>,
    description: Option<&'a str>,
    generated_at: DateTime<Utc>,
    shots: Vec<ReportRow<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow<'a> {
    index: usize,
    timestamp: f64,
    timecode: &'a str,
    screenshot: &'a str,
    description: &'a str,
}

/// Writes `<output_dir>/<file_name>` as JSON.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    file_name: String,
}

impl ReportWriter {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

impl Default for ReportWriter {
    fn default() -> Self {
        Self::new("report.json")
    }
}

#[async_trait]
impl Finalizer for ReportWriter {
    async fn finalize(&self, job: &Job, record: &ProgressRecord) -> QueueResult<PathBuf> {
        let report = Report {
            job_id: job.id.as_str(),
            title: record.video_title.as_deref(),
            description: record.video_description.as_deref(),
            generated_at: Utc::now(),
            shots: record
                .scenes
                .iter()
                .enumerate()
                .map(|(i, shot)| ReportRow {
                    index: i + 1,
                    timestamp: shot.timestamp,
                    timecode: &shot.timecode,
                    screenshot: shot.screenshot_file_name(),
                    description: shot.description.as_deref().unwrap_or(""),
                })
                .collect(),
        };

        let path = job.output_dir().join(&self.file_name);
        write_json_atomic(&path, &report)
            .await
            .map_err(|e| QueueError::finalize(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}
