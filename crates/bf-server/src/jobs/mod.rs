//! Job management
//!
//! Every submitted job runs as its own OS subprocess supervised by one
//! tokio task. Output lines land in an append-only buffer and are fanned
//! out to attached log consumers without ever blocking the subprocess.

mod cleanup;
mod manager;
mod runner;

pub use cleanup::run_retention;
pub use manager::{JobHandle, JobManager, LogSubscription};
pub use runner::{discover_artifacts, resolve_command, JobCommand};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use bf_core::types::{Action, JobId, JobStatus, LogEntry};

/// File name of the per-job configuration snapshot
pub const CONFIG_SNAPSHOT_NAME: &str = "used_config.yml";

/// Sub-directory of the job directory scanned for artifacts
pub const ARTIFACTS_DIR_NAME: &str = "artifacts";

/// Environment variable telling the converter where to put artifacts
pub const ARTIFACT_DIR_ENV: &str = "BIDSFLOW_ARTIFACT_DIR";

/// Configuration a job runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRef {
    /// YAML text supplied with the request
    Inline(String),
    /// Server-side file, relative to the server root unless absolute
    Path(PathBuf),
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub action: Action,
    pub status: JobStatus,
    pub returncode: Option<i32>,
    pub pid: Option<u32>,
    pub logs_count: usize,
    pub created_at: u64,
    pub finished_at: Option<u64>,
    pub artifacts: Vec<String>,
}

/// Short form used by the job listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub action: Action,
    pub status: JobStatus,
    pub created_at: u64,
}

/// One page of the pull side of the log channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    /// Offset to pass as `since` on the next poll
    pub next_offset: usize,
    pub status: JobStatus,
    pub returncode: Option<i32>,
}

/// What a stop request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Termination was requested
    Requested,
    /// Termination had already been requested earlier
    AlreadyRequested,
    /// The job was already terminal; nothing to do
    AlreadyFinished,
}
