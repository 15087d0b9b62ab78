//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for a job.
///
/// Clients usually reuse the upload id, which is what makes resubmission
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the id can be used as a directory name and as a protocol field.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One step of the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    /// Shot boundary detection plus screenshot extraction
    Detect,
    /// Text description for every detected shot
    Describe,
    /// Report assembly
    Finalize,
}

impl PipelineStep {
    /// The fixed pipeline every job runs.
    pub const STANDARD: [PipelineStep; 3] = [
        PipelineStep::Detect,
        PipelineStep::Describe,
        PipelineStep::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Detect => "detect",
            PipelineStep::Describe => "describe",
            PipelineStep::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job moving through the analysis pipeline.
///
/// Lives only while queued or active. Its terminal outcome is kept in the
/// persisted [`ProgressRecord`](crate::ProgressRecord), not here.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Steps to run, in order
    pub steps: Vec<PipelineStep>,

    /// Source video
    pub input_path: PathBuf,

    /// Directory receiving screenshots, the progress record and the report
    pub output_dir: PathBuf,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a job running the standard pipeline.
    pub fn new(id: JobId, input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            steps: PipelineStep::STANDARD.to_vec(),
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            created_at: Utc::now(),
        }
    }

    /// Replace the step list.
    pub fn with_steps(mut self, steps: Vec<PipelineStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}
