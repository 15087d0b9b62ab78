//! Application state.

use shotlist_queue::JobQueue;

use crate::config::ApiConfig;

/// Shared application state.
///
/// The queue is built once at startup and shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: JobQueue,
}

impl AppState {
    pub fn new(config: ApiConfig, queue: JobQueue) -> Self {
        Self { config, queue }
    }
}
