//! Shots produced by scene detection.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One detected shot.
///
/// Created by the detection step; `description` is filled in later by the
/// description worker, which rewrites the record in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Shot {
    /// Start of the shot in seconds
    #[serde(default)]
    pub timestamp: f64,
    /// Start of the shot as `HH:MM:SS.mmm`
    #[serde(default)]
    pub timecode: String,
    /// Public path of the screenshot taken at the start of the shot
    #[serde(default)]
    pub screenshot_path: String,
    /// Generated text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Shot {
    pub fn new(timestamp: f64, screenshot_path: impl Into<String>) -> Self {
        Self {
            timestamp,
            timecode: format_timecode(timestamp),
            screenshot_path: screenshot_path.into(),
            description: None,
        }
    }

    pub fn is_described(&self) -> bool {
        self.description
            .as_deref()
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false)
    }

    /// File name part of the screenshot path.
    pub fn screenshot_file_name(&self) -> &str {
        self.screenshot_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.screenshot_path)
    }
}

/// Format seconds as `HH:MM:SS.mmm`.
///
/// Negative and non-finite input is clamped to zero.
pub fn format_timecode(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    let total_ms = (seconds * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}
