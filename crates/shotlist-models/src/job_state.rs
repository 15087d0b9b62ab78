//! Job state machine.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Persisted state of a job.
///
/// States only move forward in declaration order, except `Failed`, which can
/// be entered from any non-terminal state. While `Analyzing`, the record's
/// `processing_index` says which shot is being described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted and waiting in the FIFO
    #[default]
    Submitted,
    /// Admitted; shot detection running
    Detecting,
    /// Shots detected; waiting for the description worker
    Queued,
    /// Descriptions being generated
    Analyzing,
    /// Report being assembled
    Finalizing,
    /// Done
    Complete,
    /// Failed; terminal
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Detecting => "detecting",
            JobState::Queued => "queued",
            JobState::Analyzing => "analyzing",
            JobState::Finalizing => "finalizing",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    /// Position in the forward order. `Failed` has no position.
    pub fn rank(&self) -> Option<u8> {
        match self {
            JobState::Submitted => Some(0),
            JobState::Detecting => Some(1),
            JobState::Queued => Some(2),
            JobState::Analyzing => Some(3),
            JobState::Finalizing => Some(4),
            JobState::Complete => Some(5),
            JobState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    /// States that hold the single execution slot.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobState::Detecting | JobState::Analyzing | JobState::Finalizing
        )
    }

    /// Whether moving from `self` to `next` respects the state order.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, Some(_)) => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
