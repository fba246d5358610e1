//! Job manager implementation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bf_core::config::ServerConfig;
use bf_core::error::JobError;
use bf_core::time::current_time_millis;
use bf_core::types::{done_line, Action, JobId, JobStatus, LogEntry, LogStream};

use super::runner::{self, resolve_command};
use super::{
    ConfigRef, JobSnapshot, JobSummary, LogPage, StopOutcome, ARTIFACTS_DIR_NAME,
    CONFIG_SNAPSHOT_NAME,
};

/// Note appended when a job finishes without writing anything
const NO_OUTPUT_NOTE: &str = "[INFO] no stdout/stderr output captured from job";

/// Manages every job known to this server
pub struct JobManager {
    config: ServerConfig,
    /// Jobs indexed by ID
    jobs: DashMap<JobId, Arc<JobHandle>>,
}

/// Mutable part of a job, guarded by one lock so that appends, attaches
/// and the terminal transition are totally ordered
struct JobRecord {
    status: JobStatus,
    pid: Option<u32>,
    returncode: Option<i32>,
    log: Vec<LogEntry>,
    subscribers: Vec<mpsc::UnboundedSender<LogEntry>>,
    artifacts: Vec<PathBuf>,
    finished_at: Option<u64>,
    stop_requested: bool,
}

impl JobRecord {
    /// Append to the buffer and forward to every live subscriber
    fn push(&mut self, entry: LogEntry) {
        self.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
        self.log.push(entry);
    }
}

/// Handle to one job
pub struct JobHandle {
    pub id: JobId,
    pub action: Action,
    pub created_at: u64,
    /// `<jobs_dir>/<id>`, holding the config snapshot and artifacts
    pub work_dir: PathBuf,
    cancel: CancellationToken,
    /// Open log consumers; a job with consumers is never swept
    consumers: AtomicUsize,
    record: Mutex<JobRecord>,
}

impl JobHandle {
    fn new(id: JobId, action: Action, work_dir: PathBuf) -> Self {
        Self {
            id,
            action,
            created_at: current_time_millis(),
            work_dir,
            cancel: CancellationToken::new(),
            consumers: AtomicUsize::new(0),
            record: Mutex::new(JobRecord {
                status: JobStatus::Queued,
                pid: None,
                returncode: None,
                log: Vec::new(),
                subscribers: Vec::new(),
                artifacts: Vec::new(),
                finished_at: None,
                stop_requested: false,
            }),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.record.lock().status
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let record = self.record.lock();
        JobSnapshot {
            id: self.id.clone(),
            action: self.action,
            status: record.status,
            returncode: record.returncode,
            pid: record.pid,
            logs_count: record.log.len(),
            created_at: self.created_at,
            finished_at: record.finished_at,
            artifacts: record
                .artifacts
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            action: self.action,
            status: self.status(),
            created_at: self.created_at,
        }
    }

    /// Buffered lines from `since` on, with the current status
    pub fn page(&self, since: usize) -> LogPage {
        let record = self.record.lock();
        let start = since.min(record.log.len());
        LogPage {
            logs: record.log[start..].to_vec(),
            next_offset: record.log.len(),
            status: record.status,
            returncode: record.returncode,
        }
    }

    /// Artifact paths; empty until the job is terminal
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.record.lock().artifacts.clone()
    }

    /// Number of currently attached log consumers
    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    pub fn finished_at(&self) -> Option<u64> {
        self.record.lock().finished_at
    }

    pub fn is_stop_requested(&self) -> bool {
        self.record.lock().stop_requested
    }

    /// Attach a push consumer
    ///
    /// The backlog and the live receiver are taken under the same lock, so
    /// the consumer sees every line exactly once and in order. For a
    /// terminal job the receiver is already closed.
    pub fn attach(self: &Arc<Self>) -> LogSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = {
            let mut record = self.record.lock();
            if !record.status.is_terminal() {
                record.subscribers.push(tx);
            }
            record.log.clone()
        };
        self.consumers.fetch_add(1, Ordering::SeqCst);
        LogSubscription {
            backlog,
            receiver: rx,
            _guard: ConsumerGuard(Arc::clone(self)),
        }
    }

    pub(crate) fn append(&self, stream: LogStream, line: impl Into<String>) {
        self.record.lock().push(LogEntry::new(stream, line));
    }

    pub(crate) fn mark_running(&self, pid: Option<u32>) -> bool {
        let mut record = self.record.lock();
        if !record.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        record.status = JobStatus::Running;
        record.pid = pid;
        true
    }

    /// Move to a terminal state
    ///
    /// Freezes the artifact list, appends the terminal sentinel and closes
    /// every push consumer. A second call is ignored.
    pub(crate) fn finish(
        &self,
        status: JobStatus,
        returncode: Option<i32>,
        sentinel_code: i32,
        artifacts: Vec<PathBuf>,
    ) {
        let mut record = self.record.lock();
        if !record.status.can_transition_to(status) || !status.is_terminal() {
            tracing::warn!(
                "Ignoring transition of job {} from {} to {}",
                self.id,
                record.status,
                status
            );
            return;
        }

        record.status = status;
        record.returncode = if status.has_returncode() {
            returncode
        } else {
            None
        };
        record.pid = None;
        record.artifacts = artifacts;
        record.finished_at = Some(current_time_millis());

        if record.log.iter().all(|e| e.stream == LogStream::Meta) {
            record.push(LogEntry::new(LogStream::Meta, NO_OUTPUT_NOTE));
        }
        let sentinel = done_line(sentinel_code);
        record.push(LogEntry::new(LogStream::Meta, sentinel.trim_end()));
        record.subscribers.clear();
    }

    fn request_stop(&self) -> StopOutcome {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return StopOutcome::AlreadyFinished;
        }
        if record.stop_requested {
            return StopOutcome::AlreadyRequested;
        }
        record.stop_requested = true;
        let note = match record.pid {
            Some(pid) => format!("[STOP] abort requested (pid {})", pid),
            None => "[STOP] abort requested".to_string(),
        };
        record.push(LogEntry::new(LogStream::Meta, note));
        drop(record);

        self.cancel.cancel();
        StopOutcome::Requested
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An attached push consumer
pub struct LogSubscription {
    /// Everything buffered at attach time
    pub backlog: Vec<LogEntry>,
    /// Lines appended after attach; closed once the job is terminal
    pub receiver: mpsc::UnboundedReceiver<LogEntry>,
    _guard: ConsumerGuard,
}

struct ConsumerGuard(Arc<JobHandle>);

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.0.consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobManager {
    /// Create a new job manager
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Validate, snapshot the config and launch a job
    ///
    /// Returns as soon as the job is registered; the subprocess starts on
    /// its own task.
    pub async fn submit(&self, action: &str, config: ConfigRef) -> Result<JobId, JobError> {
        let action: Action = action.parse()?;

        let source = match config {
            ConfigRef::Inline(text) => {
                if text.trim().is_empty() {
                    return Err(JobError::InvalidConfig("config is empty".to_string()));
                }
                ConfigRef::Inline(text)
            }
            ConfigRef::Path(path) => ConfigRef::Path(self.resolve_config_path(&path).await?),
        };

        let id = JobId::generate();
        let work_dir = self.config.jobs_path().join(id.as_str());
        tokio::fs::create_dir_all(work_dir.join(ARTIFACTS_DIR_NAME)).await?;
        let work_dir = tokio::fs::canonicalize(&work_dir).await?;

        let snapshot = work_dir.join(CONFIG_SNAPSHOT_NAME);
        match &source {
            ConfigRef::Inline(text) => tokio::fs::write(&snapshot, text).await?,
            ConfigRef::Path(path) => {
                tokio::fs::copy(path, &snapshot).await?;
            }
        }

        let command = resolve_command(&self.config, &snapshot, action, &work_dir);
        let handle = Arc::new(JobHandle::new(id.clone(), action, work_dir));
        self.jobs.insert(id.clone(), Arc::clone(&handle));

        tracing::info!("Job {} submitted ({})", id, action);
        tokio::spawn(runner::run_job(handle, command, self.config.clone()));

        Ok(id)
    }

    /// Resolve a server-side config path, which must stay inside the root
    async fn resolve_config_path(&self, path: &Path) -> Result<PathBuf, JobError> {
        let root = tokio::fs::canonicalize(&self.config.root)
            .await
            .map_err(|e| {
                JobError::InvalidConfig(format!(
                    "server root {} is unavailable: {}",
                    self.config.root.display(),
                    e
                ))
            })?;

        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let resolved = tokio::fs::canonicalize(&candidate).await.map_err(|_| {
            JobError::InvalidConfig(format!("config file not found: {}", path.display()))
        })?;

        if !resolved.starts_with(&root) {
            return Err(JobError::InvalidConfig(format!(
                "config path {} is outside the server root",
                path.display()
            )));
        }
        if !resolved.is_file() {
            return Err(JobError::InvalidConfig(format!(
                "config path {} is not a file",
                path.display()
            )));
        }
        Ok(resolved)
    }

    /// Get a job by ID
    pub fn get(&self, id: &JobId) -> Result<Arc<JobHandle>, JobError> {
        self.jobs
            .get(id)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub fn snapshot(&self, id: &JobId) -> Result<JobSnapshot, JobError> {
        Ok(self.get(id)?.snapshot())
    }

    /// Pull side of the log channel
    pub fn poll(&self, id: &JobId, since: usize) -> Result<LogPage, JobError> {
        Ok(self.get(id)?.page(since))
    }

    pub fn artifacts(&self, id: &JobId) -> Result<Vec<PathBuf>, JobError> {
        Ok(self.get(id)?.artifacts())
    }

    /// Push side of the log channel
    pub fn attach(&self, id: &JobId) -> Result<LogSubscription, JobError> {
        Ok(self.get(id)?.attach())
    }

    /// Request cooperative termination; a no-op on terminal jobs
    pub fn stop(&self, id: &JobId) -> Result<StopOutcome, JobError> {
        let handle = self.get(id)?;
        let outcome = handle.request_stop();
        if outcome == StopOutcome::Requested {
            tracing::info!("Stop requested for job {}", id);
        }
        Ok(outcome)
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self.jobs.iter().map(|r| r.summary()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Remove terminal jobs that finished more than `retention` ago and
    /// have no attached consumer. Returns how many were removed.
    pub fn sweep_expired(&self, retention: Duration) -> usize {
        let cutoff = current_time_millis().saturating_sub(retention.as_millis() as u64);
        let before = self.jobs.len();
        self.jobs.retain(|_, handle| match handle.finished_at() {
            Some(finished) if finished <= cutoff => handle.consumers() > 0,
            _ => true,
        });
        before.saturating_sub(self.jobs.len())
    }

    /// Number of tracked jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
