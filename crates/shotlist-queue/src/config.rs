//! Queue configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Queue and progress store configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root directory; each job gets `<data_dir>/<job_id>/`
    pub data_dir: PathBuf,
    /// Progress record file name inside a job directory
    pub record_file: String,
    /// Report file name inside a job directory
    pub report_file: String,
    /// Extra attempts when a record does not parse (the worker rewrites it in place)
    pub read_retries: u32,
    /// Delay between read attempts
    pub read_retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./uploads/scenes"),
            record_file: "metadata.json".to_string(),
            report_file: "report.json".to_string(),
            read_retries: 3,
            read_retry_delay: Duration::from_millis(50),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("SHOTLIST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            record_file: std::env::var("SHOTLIST_RECORD_FILE").unwrap_or(defaults.record_file),
            report_file: std::env::var("SHOTLIST_REPORT_FILE").unwrap_or(defaults.report_file),
            read_retries: std::env::var("SHOTLIST_READ_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            read_retry_delay: defaults.read_retry_delay,
        }
    }

    /// Config rooted at `data_dir`, other settings default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}
