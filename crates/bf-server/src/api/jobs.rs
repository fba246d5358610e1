//! Job endpoints

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use bf_core::error::JobError;
use bf_core::types::{Action, JobId};

use super::error::ApiError;
use crate::jobs::{ConfigRef, JobSnapshot, JobSummary, LogPage, StopOutcome};
use crate::state::ServerState;

/// Body of `POST /api/jobs`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub action: String,
    /// Inline YAML configuration
    #[serde(default)]
    pub config_yaml: Option<String>,
    /// Server-side configuration file
    #[serde(default, alias = "config_reference")]
    pub config_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactList {
    pub artifacts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub since: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    #[serde(default)]
    pub index: usize,
}

pub async fn ping() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub async fn list_jobs(State(state): State<ServerState>) -> Json<JobList> {
    Json(JobList {
        jobs: state.jobs.list(),
    })
}

pub async fn submit_job(
    State(state): State<ServerState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    // Action is validated before the config reference is looked at
    req.action.parse::<Action>()?;

    let config = match (req.config_yaml, req.config_path) {
        (Some(yaml), _) => ConfigRef::Inline(yaml),
        (None, Some(path)) => ConfigRef::Path(PathBuf::from(path)),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "one of config_yaml or config_path is required".to_string(),
            ))
        }
    };

    let job_id = state.jobs.submit(&req.action, config).await?;
    Ok(Json(SubmitResponse { job_id }))
}

pub async fn get_job(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(state.jobs.snapshot(&JobId::new(id))?))
}

pub async fn get_logs(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogPage>, ApiError> {
    let page = state
        .jobs
        .poll(&JobId::new(id), query.since.unwrap_or(0))?;
    Ok(Json(page))
}

pub async fn list_artifacts(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactList>, ApiError> {
    let artifacts = state
        .jobs
        .artifacts(&JobId::new(id))?
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    Ok(Json(ArtifactList { artifacts }))
}

pub async fn download_artifact(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Response, ApiError> {
    let artifacts = state.jobs.artifacts(&JobId::new(id))?;
    let path = artifacts
        .get(query.index)
        .ok_or(ApiError::ArtifactIndex {
            index: query.index,
            count: artifacts.len(),
        })?;

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiError::ArtifactMissing(path.display().to_string()))?;
    let len = file.metadata().await.map_err(JobError::Io)?.len();

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "_"))
        .unwrap_or_else(|| "artifact".to_string());

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub async fn stop_job(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = JobId::new(id);
    let outcome = state.jobs.stop(&id)?;
    let snapshot = state.jobs.snapshot(&id)?;
    let detail = match outcome {
        StopOutcome::Requested => "requested",
        StopOutcome::AlreadyRequested => "already_requested",
        StopOutcome::AlreadyFinished => "already_finished",
    };
    Ok(Json(json!({
        "ok": true,
        "stop": detail,
        "status": snapshot.status,
    })))
}

/// Browser-side error reports
pub async fn client_log(Json(report): Json<Value>) -> Json<Value> {
    tracing::warn!(target: "bidsflow::client", "{}", report);
    Json(json!({ "ok": true }))
}
