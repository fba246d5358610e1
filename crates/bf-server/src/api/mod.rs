//! HTTP and WebSocket API

mod error;
mod jobs;
mod ws;

pub use error::ApiError;
pub use jobs::{ArtifactList, JobList, SubmitRequest, SubmitResponse};
pub use ws::NOT_FOUND_FRAME;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::ServerState;

/// Build the application router
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/ping", get(jobs::ping))
        .route("/api/client-log", post(jobs::client_log))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/api/jobs/:id", get(jobs::get_job))
        .route("/api/jobs/:id/logs", get(jobs::get_logs))
        .route("/api/jobs/:id/artifacts", get(jobs::list_artifacts))
        .route("/api/jobs/:id/artifact", get(jobs::download_artifact))
        .route("/api/jobs/:id/stop", post(jobs::stop_job))
        .route("/ws/jobs/:id/logs", get(ws::job_logs_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
