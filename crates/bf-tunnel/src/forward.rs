//! Forwarding channel
//!
//! The channel is an `ssh -f -N -L` (or `autossh`) process that puts itself
//! in the background. Because it forks away from us, its PID is recovered
//! afterwards by searching the process table for its command line.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use bf_core::pidfile::{is_process_alive, terminate_process, Termination};
use bf_core::process::{find_own_processes, ProcessInfo};
use bf_core::TunnelError;

use crate::ssh::{is_installed, SshSession};

/// How often, and how far apart, the process table is searched
const PID_LOOKUP_ATTEMPTS: u32 = 10;
const PID_LOOKUP_INTERVAL: Duration = Duration::from_millis(200);

/// One local-to-remote port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Supervise the channel with `autossh`
    pub autossh: bool,
}

impl ForwardSpec {
    /// Argument of `-L`
    pub fn local_forward(&self) -> String {
        format!("{}:127.0.0.1:{}", self.local_port, self.remote_port)
    }

    /// Program whose PID identifies the channel
    pub fn program(&self) -> &'static str {
        if self.autossh {
            "autossh"
        } else {
            "ssh"
        }
    }

    /// Whether a process-table entry is this channel
    pub fn matches(&self, process: &ProcessInfo) -> bool {
        let forward = self.local_forward();
        let joined = format!("-L{}", forward);
        process.program() == self.program()
            && process.cmd.iter().any(|a| *a == forward || *a == joined)
            && process.cmd.iter().any(|a| *a == self.target)
    }
}

/// Opens and closes forwarding channels
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Fail with `ToolMissing` if the tools a channel needs are absent
    fn check_tools(&self, _autossh: bool) -> Result<(), TunnelError> {
        Ok(())
    }

    /// Open the channel; `None` when it started but its PID was not found
    async fn open(&self, spec: &ForwardSpec) -> Result<Option<u32>, TunnelError>;

    async fn close(&self, pid: u32, grace: Duration) -> Termination;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Forwarder backed by the system `ssh` or `autossh`
pub struct SshForwarder {
    ssh: SshSession,
    log_path: PathBuf,
}

impl SshForwarder {
    /// `log_path` receives the channel's stderr
    pub fn new(ssh: SshSession, log_path: impl Into<PathBuf>) -> Self {
        Self {
            ssh,
            log_path: log_path.into(),
        }
    }

    fn log_file(&self) -> io::Result<std::fs::File> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
    }

    fn log_tail(&self) -> String {
        std::fs::read_to_string(&self.log_path)
            .ok()
            .and_then(|s| s.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string))
            .unwrap_or_else(|| "no output".to_string())
    }
}

#[async_trait]
impl Forwarder for SshForwarder {
    fn check_tools(&self, autossh: bool) -> Result<(), TunnelError> {
        if autossh && !is_installed("autossh") {
            return Err(TunnelError::ToolMissing("autossh".to_string()));
        }
        Ok(())
    }

    async fn open(&self, spec: &ForwardSpec) -> Result<Option<u32>, TunnelError> {
        self.check_tools(spec.autossh)?;

        let leading: &[&str] = if spec.autossh { &["-M", "0"] } else { &[] };
        let mut cmd = self.ssh.command(spec.program(), leading);
        cmd.args([
            "-f",
            "-N",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ServerAliveCountMax=3",
            "-L",
        ])
        .arg(spec.local_forward())
        .arg(&spec.target);

        // A backgrounded ssh keeps its stdio open, so it must not be a pipe
        let log = self
            .log_file()
            .map_err(|e| TunnelError::Connection(format!("cannot open {:?}: {}", self.log_path, e)))?;
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(log);

        tracing::info!(
            "Opening channel localhost:{} -> {}:{} via {}",
            spec.local_port,
            spec.target,
            spec.remote_port,
            spec.program()
        );
        let status = cmd.status().await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TunnelError::ToolMissing(spec.program().to_string()),
            _ => TunnelError::Connection(format!("failed to run {}: {}", spec.program(), e)),
        })?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let detail = self.log_tail();
            if detail.contains("Permission denied") {
                return Err(TunnelError::AuthenticationFailed(spec.target.clone()));
            }
            return Err(TunnelError::Connection(format!(
                "forwarding to {} failed (exit {}): {}",
                spec.target, code, detail
            )));
        }

        for _ in 0..PID_LOOKUP_ATTEMPTS {
            let wanted = spec.clone();
            let found = tokio::task::spawn_blocking(move || {
                find_own_processes(|p| wanted.matches(p))
                    .into_iter()
                    .map(|p| p.pid)
                    .max()
            })
            .await
            .ok()
            .flatten();
            if let Some(pid) = found {
                tracing::debug!("Forwarding channel is PID {}", pid);
                return Ok(Some(pid));
            }
            tokio::time::sleep(PID_LOOKUP_INTERVAL).await;
        }
        Ok(None)
    }

    async fn close(&self, pid: u32, grace: Duration) -> Termination {
        terminate_process(pid, grace).await
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}
