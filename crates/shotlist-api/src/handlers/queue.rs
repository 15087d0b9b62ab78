//! Queue inspection handler.

use axum::extract::State;
use axum::Json;
use shotlist_queue::QueueSnapshot;

use crate::state::AppState;

/// The active job and the ids waiting behind it, in admission order.
pub async fn get_queue(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.queue.snapshot().await)
}
