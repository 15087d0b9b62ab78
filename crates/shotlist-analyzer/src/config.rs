//! Analyzer configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Program plus arguments used to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run an inline shell script with `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Parse a whitespace separated argument string.
    pub fn with_args_str(mut self, args: &str) -> Self {
        self.args = args.split_whitespace().map(str::to_string).collect();
        self
    }
}

impl std::fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Configuration for the worker supervisor.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Persistent vision worker (descriptions, and detection unless `detector` is set)
    pub worker: WorkerCommand,
    /// Separate scene detection worker
    pub detector: Option<WorkerCommand>,
    /// Working directory for worker processes
    pub working_dir: Option<PathBuf>,
    /// Time allowed between spawn and `READY` (model loading)
    pub startup_timeout: Duration,
    /// Time allowed for a single request
    pub request_timeout: Duration,
    /// Time allowed for a worker to exit after `EXIT`
    pub shutdown_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            worker: WorkerCommand::new("python3")
                .arg("scripts/process_scene_queue.py")
                .arg("--persistent"),
            detector: None,
            working_dir: None,
            startup_timeout: Duration::from_secs(300), // 5 minutes
            request_timeout: Duration::from_secs(3600), // 1 hour
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl AnalyzerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker = match std::env::var("WORKER_PROGRAM") {
            Ok(program) => WorkerCommand::new(program)
                .with_args_str(&std::env::var("WORKER_ARGS").unwrap_or_default()),
            Err(_) => match std::env::var("WORKER_ARGS") {
                Ok(args) => WorkerCommand::new(defaults.worker.program.clone()).with_args_str(&args),
                Err(_) => defaults.worker.clone(),
            },
        };

        let detector = std::env::var("DETECTOR_PROGRAM").ok().map(|program| {
            WorkerCommand::new(program)
                .with_args_str(&std::env::var("DETECTOR_ARGS").unwrap_or_default())
        });

        Self {
            worker,
            detector,
            working_dir: std::env::var("WORKER_DIR").ok().map(PathBuf::from),
            startup_timeout: Duration::from_secs(
                std::env::var("WORKER_STARTUP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            request_timeout: Duration::from_secs(
                std::env::var("WORKER_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
        }
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_detector(mut self, detector: WorkerCommand) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
