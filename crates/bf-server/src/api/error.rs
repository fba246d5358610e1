//! HTTP error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use bf_core::error::JobError;

/// Error returned by API handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Artifact index {index} out of range ({count} artifacts)")]
    ArtifactIndex { index: usize, count: usize },

    #[error("Artifact file missing: {0}")]
    ArtifactMissing(String),

    #[error("{0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Job(e) => match e {
                JobError::InvalidAction(_) | JobError::InvalidConfig(_) => {
                    StatusCode::BAD_REQUEST
                }
                JobError::NotFound(_) => StatusCode::NOT_FOUND,
                JobError::SubprocessSpawnFailed(_) | JobError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::ArtifactIndex { .. } | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ArtifactMissing(_) => StatusCode::NOT_FOUND,
        }
    }

    fn kind(&self) -> Option<&'static str> {
        match self {
            ApiError::Job(JobError::InvalidAction(_)) => Some("invalid_action"),
            ApiError::Job(JobError::InvalidConfig(_)) => Some("invalid_config"),
            ApiError::Job(JobError::NotFound(_)) => Some("job_not_found"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        let body = Json(ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(JobError::InvalidAction("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(JobError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::ArtifactIndex { index: 3, count: 1 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(JobError::Io(std::io::Error::other("disk"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
