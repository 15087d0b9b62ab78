//! Progress record persisted per job and polled by clients.
//!
//! The record is shared with the description worker, which reads `scenes`
//! and rewrites `scenes`, `processingIndex`, `descriptionsComplete` and
//! `progress` while it runs. Keys are camelCase and every field has a
//! default so a record touched by the worker always parses.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JobId, JobState, Shot};

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// User-editable fields, independent of pipeline progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_description: Option<String>,
}

impl Annotations {
    pub fn is_empty(&self) -> bool {
        self.video_title.is_none() && self.video_description.is_none()
    }
}

/// Polled view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// Job ID
    #[serde(default = "JobId::new")]
    pub job_id: JobId,
    /// Current state
    #[serde(default)]
    pub status: JobState,
    /// Produced shots, in order (append-only)
    #[serde(default)]
    pub scenes: Vec<Shot>,
    /// Number of produced shots
    #[serde(default)]
    pub scene_count: usize,
    /// Every shot has been described
    #[serde(default)]
    pub descriptions_complete: bool,
    /// Shot being described, -1 when none
    #[serde(default = "no_index")]
    pub processing_index: i64,
    /// Progress percentage (0-100)
    #[serde(default)]
    pub progress: u8,
    /// Report has been assembled
    #[serde(default)]
    pub report_ready: bool,
    /// Location of the assembled report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    /// Waiting for the execution slot or the worker
    #[serde(default)]
    pub queued: bool,
    /// Position in the FIFO (0 = next); filled when polled, never stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// User-supplied title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_title: Option<String>,
    /// User-supplied description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_description: Option<String>,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn no_index() -> i64 {
    -1
}

impl ProgressRecord {
    /// Fresh record for an accepted job.
    pub fn submitted(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobState::Submitted,
            scenes: Vec::new(),
            scene_count: 0,
            descriptions_complete: false,
            processing_index: -1,
            progress: 0,
            report_ready: false,
            report_path: None,
            queued: true,
            queue_position: None,
            video_title: None,
            video_description: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, refusing backwards moves and moves out of a terminal state.
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.queued = matches!(next, JobState::Submitted | JobState::Queued);
        if next != JobState::Analyzing {
            self.processing_index = -1;
        }
        self.touch();
        Ok(())
    }

    /// Mark as failed with a reason.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Append shots produced by detection.
    pub fn push_scenes(&mut self, shots: impl IntoIterator<Item = Shot>) {
        self.scenes.extend(shots);
        self.touch();
    }

    pub fn annotations(&self) -> Annotations {
        Annotations {
            video_title: self.video_title.clone(),
            video_description: self.video_description.clone(),
        }
    }

    /// Overwrite the annotation fields that are set in `annotations`.
    pub fn apply_annotations(&mut self, annotations: &Annotations) {
        if let Some(title) = &annotations.video_title {
            self.video_title = Some(title.clone());
        }
        if let Some(description) = &annotations.video_description {
            self.video_description = Some(description.clone());
        }
        self.updated_at = Utc::now();
    }

    /// Number of shots that already carry a description.
    pub fn described_count(&self) -> usize {
        self.scenes.iter().filter(|s| s.is_described()).count()
    }

    /// Whether deleting the job's files now would pull them from under the pipeline.
    pub fn is_in_progress(&self) -> bool {
        let has_units = !self.scenes.is_empty();
        (!self.is_terminal() && has_units)
            || (self.status == JobState::Complete && has_units && !self.report_ready)
    }

    /// Recompute denormalized fields and bump `updated_at`.
    pub fn touch(&mut self) {
        self.scene_count = self.scenes.len();
        self.progress = self.derived_progress();
        self.updated_at = Utc::now();
    }

    fn derived_progress(&self) -> u8 {
        match self.status {
            JobState::Complete | JobState::Finalizing => 100,
            JobState::Analyzing if !self.scenes.is_empty() => {
                let pct = self.described_count() * 100 / self.scenes.len();
                pct.min(100) as u8
            }
            JobState::Failed => self.progress,
            _ => 0,
        }
    }
}
