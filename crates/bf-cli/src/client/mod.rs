//! HTTP client for the job server
//!
//! Every failure comes back as a [`BfError`] so the command-line front end
//! can pick a stable exit code. Server rejections are mapped back onto the
//! [`JobError`] kind reported in the error body.

mod follow;

pub use follow::{FollowEvent, FollowInput, FollowMachine, FollowState, LogFollower};

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use bf_core::error::{BfError, JobError, TunnelError};
use bf_core::types::{Action, JobId};
use bf_server::api::{ArtifactList, JobList, SubmitRequest, SubmitResponse};
use bf_server::jobs::{JobSnapshot, LogPage};

/// Default address of a local job server
pub const DEFAULT_URL: &str = "http://127.0.0.1:8080";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration a job is submitted with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobConfig {
    /// YAML text read on this side
    Inline(String),
    /// File on the server host
    ServerPath(String),
}

/// Error body written by the server
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    kind: Option<String>,
}

/// Reply of `POST /api/jobs/{id}/stop`
#[derive(Debug, Clone, Deserialize)]
pub struct StopReply {
    /// `requested`, `already_requested` or `already_finished`
    pub stop: String,
    pub status: bf_core::types::JobStatus,
}

/// Client for one job server
#[derive(Debug, Clone)]
pub struct JobClient {
    base: String,
    http: reqwest::Client,
}

impl JobClient {
    pub fn new(base_url: &str) -> Result<Self, BfError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(connection_error)?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// URL of the push side of the log channel for a job
    pub fn ws_url(&self, id: &JobId) -> String {
        let base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base.clone()
        };
        format!("{}/ws/jobs/{}/logs", base, id)
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<bool, BfError> {
        let resp = self
            .http
            .get(self.url("/api/ping"))
            .send()
            .await
            .map_err(connection_error)?;
        let body: Value = json(check(resp, "ping").await?).await?;
        Ok(body.get("ok").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Submit a job; the action is validated before anything is sent
    pub async fn submit(&self, action: &str, config: JobConfig) -> Result<JobId, BfError> {
        let action: Action = action.parse()?;
        let mut request = SubmitRequest {
            action: action.as_str().to_string(),
            ..Default::default()
        };
        match config {
            JobConfig::Inline(yaml) => request.config_yaml = Some(yaml),
            JobConfig::ServerPath(path) => request.config_path = Some(path),
        }

        let resp = self
            .http
            .post(self.url("/api/jobs"))
            .json(&request)
            .send()
            .await
            .map_err(connection_error)?;
        let reply: SubmitResponse = json(check(resp, action.as_str()).await?).await?;
        tracing::info!("Submitted {} job {}", action, reply.job_id);
        Ok(reply.job_id)
    }

    pub async fn job(&self, id: &JobId) -> Result<JobSnapshot, BfError> {
        self.get_json(&format!("/api/jobs/{}", id), id).await
    }

    /// One page of the pull side of the log channel
    pub async fn logs(&self, id: &JobId, since: usize) -> Result<LogPage, BfError> {
        self.get_json(&format!("/api/jobs/{}/logs?since={}", id, since), id)
            .await
    }

    pub async fn artifacts(&self, id: &JobId) -> Result<Vec<String>, BfError> {
        let list: ArtifactList = self
            .get_json(&format!("/api/jobs/{}/artifacts", id), id)
            .await?;
        Ok(list.artifacts)
    }

    /// Download an artifact, returning the server-side file name and content
    pub async fn download(&self, id: &JobId, index: usize) -> Result<(String, Vec<u8>), BfError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/jobs/{}/artifact?index={}", id, index)))
            .send()
            .await
            .map_err(connection_error)?;
        let resp = check(resp, id.as_str()).await?;
        let filename = resp
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_filename)
            .unwrap_or_else(|| format!("artifact-{}", index));
        let bytes = resp.bytes().await.map_err(connection_error)?;
        Ok((filename, bytes.to_vec()))
    }

    /// Request termination of a job
    pub async fn stop(&self, id: &JobId) -> Result<StopReply, BfError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/jobs/{}/stop", id)))
            .send()
            .await
            .map_err(connection_error)?;
        json(check(resp, id.as_str()).await?).await
    }

    pub async fn list(&self) -> Result<JobList, BfError> {
        let resp = self
            .http
            .get(self.url("/api/jobs"))
            .send()
            .await
            .map_err(connection_error)?;
        json(check(resp, "jobs").await?).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, id: &JobId) -> Result<T, BfError> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(connection_error)?;
        json(check(resp, id.as_str()).await?).await
    }
}

fn connection_error(e: reqwest::Error) -> BfError {
    TunnelError::Connection(e.to_string()).into()
}

async fn json<T: DeserializeOwned>(resp: Response) -> Result<T, BfError> {
    resp.json().await.map_err(|e| {
        BfError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected response: {}", e),
        ))
    })
}

/// Turn a non-success response into the matching error
///
/// `subject` names what was asked for (job id or action) in the error.
async fn check(resp: Response, subject: &str) -> Result<Response, BfError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body: ErrorBody = resp.json().await.unwrap_or_default();
    let err = match body.kind.as_deref() {
        Some("job_not_found") => JobError::NotFound(subject.to_string()).into(),
        Some("invalid_action") => JobError::InvalidAction(subject.to_string()).into(),
        Some("invalid_config") => JobError::InvalidConfig(body.error).into(),
        _ if status == StatusCode::NOT_FOUND && body.error.is_empty() => {
            JobError::NotFound(subject.to_string()).into()
        }
        _ => BfError::Io(std::io::Error::other(format!(
            "server answered {}: {}",
            status, body.error
        ))),
    };
    Err(err)
}

/// File name from a `Content-Disposition: attachment; filename="..."` header
fn attachment_filename(header: &str) -> Option<String> {
    let value = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?;
    let name = value.trim_matches('"');
    // Never write outside the chosen directory
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    (!name.is_empty()).then(|| name.to_string())
}
