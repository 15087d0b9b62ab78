//! Worker process supervisor.
//!
//! Owns the lifecycle of each worker role: lazy start on first use, the
//! `READY` handshake, reuse across jobs, crash detection and respawn.
//! Exactly one handle per role is live at a time; callers share it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::ProtocolChannel;
use crate::config::{AnalyzerConfig, WorkerCommand};
use crate::error::{AnalyzerError, AnalyzerResult};
use crate::protocol::{Request, Response};

/// Category of worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// Persistent model worker: descriptions, and detection by default
    Vision,
    /// Dedicated scene detection worker, when one is configured
    SceneDetector,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 2] = [WorkerRole::Vision, WorkerRole::SceneDetector];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Vision => "vision",
            WorkerRole::SceneDetector => "scene_detector",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A started worker process that completed its handshake.
pub struct WorkerHandle {
    role: WorkerRole,
    generation: u64,
    pid: Option<u32>,
    channel: ProtocolChannel,
    child: Mutex<Child>,
    request_timeout: Duration,
}

impl WorkerHandle {
    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Spawn counter value when this handle was created; increases on every respawn.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    /// Send one request and wait for its response.
    ///
    /// Callers must not overlap requests on the same handle. A timeout is
    /// treated like a crash: the process is killed and the handle is dead.
    pub async fn send(&self, request: Request) -> AnalyzerResult<Response> {
        match self.channel.request(&request, self.request_timeout).await {
            Ok(response) => Ok(response),
            Err(e @ AnalyzerError::Timeout(_)) => {
                warn!(role = %self.role, pid = ?self.pid, "Worker timed out on {}, killing it", request.opcode());
                self.kill(&e.to_string()).await;
                Err(e)
            }
            Err(e @ AnalyzerError::WorkerCrashed(_)) => {
                self.kill(&e.to_string()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Kill the process and fail anything pending.
    pub async fn kill(&self, reason: &str) {
        self.channel.close(reason);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(role = %self.role, pid = ?self.pid, "Kill failed (already exited?): {}", e);
        }
    }

    /// Ask the worker to exit, then kill it if it does not within `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        if self.is_alive() {
            if let Err(e) = self.channel.request(&Request::Exit, grace).await {
                debug!(role = %self.role, "Could not send EXIT: {}", e);
            }
        }

        let exited = {
            let mut child = self.child.lock().await;
            tokio::time::timeout(grace, child.wait()).await
        };
        match exited {
            Ok(Ok(status)) => info!(role = %self.role, pid = ?self.pid, "Worker exited: {}", status),
            Ok(Err(e)) => warn!(role = %self.role, "Failed waiting for worker: {}", e),
            Err(_) => {
                warn!(role = %self.role, pid = ?self.pid, "Worker ignored EXIT, killing it");
                self.kill("shutdown").await;
                return;
            }
        }
        self.channel.close("shutdown");
    }
}

/// Starts worker processes on demand and keeps one live handle per role.
pub struct WorkerSupervisor {
    config: AnalyzerConfig,
    slots: HashMap<WorkerRole, Mutex<Option<Arc<WorkerHandle>>>>,
    spawned: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(config: AnalyzerConfig) -> Self {
        let slots = WorkerRole::ALL
            .into_iter()
            .map(|role| (role, Mutex::new(None)))
            .collect();
        Self {
            config,
            slots,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn from_env() -> Self {
        Self::new(AnalyzerConfig::from_env())
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Role that serves detection requests.
    pub fn detection_role(&self) -> WorkerRole {
        if self.config.detector.is_some() {
            WorkerRole::SceneDetector
        } else {
            WorkerRole::Vision
        }
    }

    /// Total processes started so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Return the live handle for `role`, starting a worker if there is none.
    ///
    /// Concurrent callers for the same role wait on the same startup; a
    /// second process is never spawned while the first is still loading.
    pub async fn acquire(&self, role: WorkerRole) -> AnalyzerResult<Arc<WorkerHandle>> {
        let slot = self.slot(role)?;
        let mut current = slot.lock().await;

        if let Some(handle) = current.as_ref() {
            if handle.is_alive() {
                return Ok(Arc::clone(handle));
            }
            info!(role = %role, generation = handle.generation(), "Worker is gone, starting a new one");
            *current = None;
        }

        let handle = Arc::new(self.start(role).await?);
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Send through `handle`, dropping it from the cache if the worker died.
    pub async fn send(&self, handle: &Arc<WorkerHandle>, request: Request) -> AnalyzerResult<Response> {
        let result = handle.send(request).await;
        if let Err(e) = &result {
            if e.is_worker_fault() {
                counter!("shotlist_worker_crashes_total", "role" => handle.role().as_str()).increment(1);
                self.invalidate(handle).await;
            }
        }
        result
    }

    /// Forget `handle` if it is still the cached one for its role.
    pub async fn invalidate(&self, handle: &Arc<WorkerHandle>) {
        if let Ok(slot) = self.slot(handle.role()) {
            let mut current = slot.lock().await;
            if current.as_ref().map(|h| Arc::ptr_eq(h, handle)).unwrap_or(false) {
                *current = None;
            }
        }
    }

    /// Stop every running worker.
    pub async fn shutdown(&self) {
        for role in WorkerRole::ALL {
            let handle = match self.slot(role) {
                Ok(slot) => slot.lock().await.take(),
                Err(_) => None,
            };
            if let Some(handle) = handle {
                info!(role = %role, pid = ?handle.pid(), "Stopping worker");
                handle.shutdown(self.config.shutdown_timeout).await;
            }
        }
    }

    fn slot(&self, role: WorkerRole) -> AnalyzerResult<&Mutex<Option<Arc<WorkerHandle>>>> {
        self.slots
            .get(&role)
            .ok_or_else(|| AnalyzerError::spawn_failed(format!("unknown worker role {}", role)))
    }

    fn command_for(&self, role: WorkerRole) -> &WorkerCommand {
        match role {
            WorkerRole::SceneDetector => self.config.detector.as_ref().unwrap_or(&self.config.worker),
            WorkerRole::Vision => &self.config.worker,
        }
    }

    async fn start(&self, role: WorkerRole) -> AnalyzerResult<WorkerHandle> {
        let command = self.command_for(role);
        let program = which::which(&command.program).map_err(|e| {
            AnalyzerError::spawn_failed(format!("{} not found: {}", command.program, e))
        })?;

        info!(role = %role, "Starting worker: {}", command);

        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Model loading and per-shot logs go straight to our stderr
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AnalyzerError::spawn_failed(format!("{}: {}", command, e)))?;

        let generation = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        counter!("shotlist_worker_spawns_total", "role" => role.as_str()).increment(1);

        let pid = child.id();
        let (stdout, stdin) = match (child.stdout.take(), child.stdin.take()) {
            (Some(stdout), Some(stdin)) => (stdout, stdin),
            _ => {
                let _ = child.kill().await;
                return Err(AnalyzerError::spawn_failed("worker pipes unavailable"));
            }
        };

        let channel = ProtocolChannel::spawn(stdout, stdin, format!("{}#{}", role, generation));

        if let Err(e) = channel.wait_ready(self.config.startup_timeout).await {
            warn!(role = %role, pid = ?pid, "Worker failed to start: {}", e);
            channel.close(&e.to_string());
            let _ = child.kill().await;
            return Err(e);
        }

        info!(role = %role, pid = ?pid, generation, "Worker ready");

        Ok(WorkerHandle {
            role,
            generation,
            pid,
            channel,
            child: Mutex::new(child),
            request_timeout: self.config.request_timeout,
        })
    }
}
