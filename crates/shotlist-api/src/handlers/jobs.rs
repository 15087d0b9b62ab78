//! Job submission, status polling, annotation and deletion.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use shotlist_models::{Annotations, JobId, ProgressRecord};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Submit request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Reuse an id to rerun a finished job. A fresh id is generated otherwise.
    #[serde(default)]
    pub job_id: Option<String>,
    pub input_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    /// False when the id was already waiting or running.
    pub accepted: bool,
}

/// Status poll result.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum JobStatusResponse {
    Record(Box<ProgressRecord>),
    #[serde(rename_all = "camelCase")]
    NotStarted { job_id: JobId, status: &'static str },
}

fn parse_job_id(raw: String) -> ApiResult<JobId> {
    let id = JobId::from(raw);
    if !id.is_valid() {
        return Err(ApiError::bad_request(format!("invalid job id: {:?}", id.as_str())));
    }
    Ok(id)
}

/// POST /api/jobs
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let input = req.input_path.trim();
    if input.is_empty() {
        return Err(ApiError::bad_request("inputPath is required"));
    }
    // Paths travel in a line-oriented, pipe-delimited frame.
    if input.contains(['|', '\n', '\r']) {
        return Err(ApiError::bad_request("inputPath contains reserved characters"));
    }

    let job_id = match req.job_id {
        Some(raw) => parse_job_id(raw)?,
        None => JobId::new(),
    };

    let job = state.queue.new_job(job_id.clone(), input);
    let outcome = state.queue.submit(job).await?;
    info!(job_id = %job_id, accepted = outcome.is_accepted(), "Submit request handled");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            accepted: outcome.is_accepted(),
        }),
    ))
}

/// GET /api/jobs/:job_id
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job_id = parse_job_id(job_id)?;

    let response = match state.queue.status(&job_id).await? {
        Some(record) => JobStatusResponse::Record(Box::new(record)),
        None => JobStatusResponse::NotStarted {
            job_id,
            status: "not_started",
        },
    };
    Ok(Json(response))
}

/// PATCH /api/jobs/:job_id
pub async fn annotate_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(annotations): Json<Annotations>,
) -> ApiResult<Json<ProgressRecord>> {
    let job_id = parse_job_id(job_id)?;
    if annotations.is_empty() {
        return Err(ApiError::bad_request("nothing to update"));
    }

    let record = state.queue.annotate(&job_id, annotations).await?;
    Ok(Json(record))
}

/// DELETE /api/jobs/:job_id
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<StatusCode> {
    let job_id = parse_job_id(job_id)?;
    state.queue.delete(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
