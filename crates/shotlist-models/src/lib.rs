//! Shared data models for the shotlist backend.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their pipeline steps
//! - Job states and the persisted progress record polled by clients
//! - Shots (the units produced by scene detection) and timecodes

pub mod job;
pub mod job_state;
pub mod progress;
pub mod shot;

// Re-export common types
pub use job::{Job, JobId, PipelineStep};
pub use job_state::JobState;
pub use progress::{Annotations, ProgressRecord, TransitionError};
pub use shot::{format_timecode, Shot};
