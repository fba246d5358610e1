//! Core domain types shared by the server, the supervisor and the clients

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::JobError;

/// Marker that opens the terminal sentinel line of every job log
pub const JOB_DONE_MARKER: &str = "__JOB_DONE__";

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing ID string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Conversion action passed to the converter as a flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Analyse,
    Run,
    Report,
}

impl Action {
    /// Every accepted action, in display order
    pub const ALL: [Action; 3] = [Action::Analyse, Action::Run, Action::Report];

    /// Command-line flag understood by the converter
    pub fn flag(&self) -> &'static str {
        match self {
            Action::Analyse => "--analyse",
            Action::Run => "--run",
            Action::Report => "--report",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Analyse => "analyse",
            Action::Run => "run",
            Action::Report => "report",
        }
    }
}

impl FromStr for Action {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyse" => Ok(Action::Analyse),
            "run" => Ok(Action::Run),
            "report" => Ok(Action::Report),
            other => Err(JobError::InvalidAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job
///
/// Transitions only move forward: `Queued -> Running -> terminal`, or
/// `Queued -> terminal` when the subprocess never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    /// Whether the job has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted
        )
    }

    /// Whether a job in this state carries a return code
    pub fn has_returncode(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Origin of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Notes written by the server itself
    Meta,
}

/// One entry of a job's log buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogStream,
    pub line: String,
    /// Milliseconds since the UNIX epoch
    #[serde(default)]
    pub timestamp: u64,
}

impl LogEntry {
    pub fn new(stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            stream,
            line: line.into(),
            timestamp: crate::time::current_time_millis(),
        }
    }
}

/// Build the terminal sentinel line for the given exit code
pub fn done_line(code: i32) -> String {
    format!("{} returncode={}\n", JOB_DONE_MARKER, code)
}

/// Extract the exit code from a terminal sentinel line
///
/// Returns `None` for lines that are not sentinels. A sentinel with an
/// unparseable code still counts as terminal and yields `Some(None)`.
pub fn parse_done_line(line: &str) -> Option<Option<i32>> {
    let rest = line.trim_start().strip_prefix(JOB_DONE_MARKER)?;
    let code = rest
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("returncode="))
        .and_then(|v| v.parse::<i32>().ok());
    Some(code)
}

/// How a running service instance was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSource {
    /// Recorded in a PID file
    Pidfile,
    /// Found only in the process table; its PID file is missing
    Orphan,
}

/// One running copy of the job server, as reported by `service-ctl list --json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub port: u16,
    pub pid: u32,
    pub source: InstanceSource,
}
