//! Subprocess supervision for a single job

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use bf_core::config::ServerConfig;
use bf_core::error::JobError;
use bf_core::pidfile;
use bf_core::types::{Action, JobStatus, LogStream};

use super::manager::JobHandle;
use super::{ARTIFACTS_DIR_NAME, ARTIFACT_DIR_ENV};

/// Return code recorded when the converter cannot be started at all
pub const SPAWN_FAILED_CODE: i32 = 127;

/// Sentinel code for a job stopped before its subprocess existed
const ABORTED_BEFORE_START_CODE: i32 = -1;

/// How long output readers may lag behind process exit
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Fully resolved converter invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub envs: Vec<(String, PathBuf)>,
}

impl JobCommand {
    /// Command line as shown in the `[CMD]` log line
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Build the converter command line for one job
///
/// An executable converter that is not a Python script runs directly;
/// anything else runs through the configured interpreter.
pub fn resolve_command(
    config: &ServerConfig,
    snapshot: &Path,
    action: Action,
    work_dir: &Path,
) -> JobCommand {
    let converter = config.converter_path();
    let converter = std::fs::canonicalize(&converter).unwrap_or(converter);

    let mut args: Vec<OsString> = Vec::new();
    let program = if runs_directly(&converter) {
        converter
    } else {
        args.push(converter.into_os_string());
        PathBuf::from(&config.python)
    };
    args.push("--config".into());
    args.push(snapshot.as_os_str().to_owned());
    args.push(action.flag().into());

    JobCommand {
        program,
        args,
        cwd: config.root.clone(),
        envs: vec![(
            ARTIFACT_DIR_ENV.to_string(),
            work_dir.join(ARTIFACTS_DIR_NAME),
        )],
    }
}

fn runs_directly(path: &Path) -> bool {
    if path.extension().is_some_and(|ext| ext == "py") {
        return false;
    }
    is_executable(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            matches!(ext.as_str(), "exe" | "bat" | "cmd")
        })
}

/// Collect a job's artifacts
///
/// Every regular file under `artifacts_dir` (sorted), then each existing
/// extra file. Duplicates are dropped.
pub fn discover_artifacts(artifacts_dir: &Path, extras: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    collect_files(artifacts_dir, &mut found);
    found.sort();

    for extra in extras {
        if extra.is_file() && !found.contains(extra) {
            found.push(extra.clone());
        }
    }
    found
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_files(&path, out),
            Ok(ft) if ft.is_file() => out.push(path),
            _ => {}
        }
    }
}

/// Drive one job from spawn to terminal state
pub(crate) async fn run_job(handle: Arc<JobHandle>, command: JobCommand, config: ServerConfig) {
    handle.append(LogStream::Meta, format!("[CMD] {}", command.display()));

    if handle.is_stop_requested() {
        tracing::info!("Job {} stopped before start", handle.id);
        finish(
            &handle,
            &config,
            JobStatus::Aborted,
            None,
            ABORTED_BEFORE_START_CODE,
        )
        .await;
        return;
    }

    let mut child = match spawn(&command) {
        Ok(child) => child,
        Err(e) => {
            let err = JobError::SubprocessSpawnFailed(format!(
                "{}: {}",
                command.program.display(),
                e
            ));
            tracing::warn!("Job {}: {}", handle.id, err);
            handle.append(LogStream::Stderr, err.to_string());
            finish(
                &handle,
                &config,
                JobStatus::Failed,
                Some(SPAWN_FAILED_CODE),
                SPAWN_FAILED_CODE,
            )
            .await;
            return;
        }
    };

    let pid = child.id();
    handle.mark_running(pid);
    tracing::info!("Job {} running (pid {:?})", handle.id, pid);

    let readers: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(Arc::clone(&handle), LogStream::Stdout, out))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(Arc::clone(&handle), LogStream::Stderr, err))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = handle.cancel_token().cancelled() => None,
    };
    let status = match waited {
        Some(status) => status,
        None => stop_child(&mut child, config.stop_grace).await,
    };

    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN, &mut reader).await.is_err() {
            tracing::warn!("Job {} output still open after exit, detaching", handle.id);
            reader.abort();
        }
    }

    let (final_status, returncode, sentinel) = match status {
        Ok(status) => classify(status, handle.is_stop_requested()),
        Err(e) => {
            handle.append(LogStream::Stderr, format!("Failed to wait for job: {}", e));
            (JobStatus::Failed, Some(-1), -1)
        }
    };
    tracing::info!(
        "Job {} finished: {} (sentinel code {})",
        handle.id,
        final_status,
        sentinel
    );
    finish(&handle, &config, final_status, returncode, sentinel).await;
}

fn spawn(command: &JobCommand) -> io::Result<Child> {
    Command::new(&command.program)
        .args(&command.args)
        .current_dir(&command.cwd)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Read one output stream line by line into the job's buffer
async fn pump<R: AsyncRead + Unpin>(handle: Arc<JobHandle>, stream: LogStream, reader: R) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                handle.append(stream, line.trim_end_matches(|c: char| c == '\n' || c == '\r'));
            }
            Err(e) => {
                tracing::debug!("Job {} {:?} read error: {}", handle.id, stream, e);
                break;
            }
        }
    }
}

/// Graceful-then-forceful stop of the job subprocess
async fn stop_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = pidfile::request_terminate(pid) {
            tracing::debug!("Terminate request to job PID {} failed: {}", pid, e);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!("Job process ignored termination for {:?}, killing", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Map an exit status to (status, returncode, sentinel code)
fn classify(status: ExitStatus, stop_requested: bool) -> (JobStatus, Option<i32>, i32) {
    let raw = raw_code(&status);
    if stop_requested {
        return (JobStatus::Aborted, None, raw);
    }
    match raw {
        0 => (JobStatus::Completed, Some(0), 0),
        code => (JobStatus::Failed, Some(code), code),
    }
}

/// Exit code, or the negated signal number for signal deaths
#[cfg(unix)]
fn raw_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn raw_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn finish(
    handle: &JobHandle,
    config: &ServerConfig,
    status: JobStatus,
    returncode: Option<i32>,
    sentinel: i32,
) {
    let artifacts_dir = handle.work_dir.join(ARTIFACTS_DIR_NAME);
    let extras: Vec<PathBuf> = config
        .extra_artifacts
        .iter()
        .map(|p| config.resolve(p))
        .collect();
    let artifacts =
        tokio::task::spawn_blocking(move || discover_artifacts(&artifacts_dir, &extras))
            .await
            .unwrap_or_default();

    handle.finish(status, returncode, sentinel, artifacts);
}
