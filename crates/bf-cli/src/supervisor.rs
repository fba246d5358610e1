//! Process Supervisor
//!
//! Starts, stops and inspects `bidsflow-server` instances on this host.
//! Each instance is identified by its port: its PID file and log file are
//! named after it, so several instances share one state directory.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use bf_core::config::ServiceConfig;
use bf_core::pidfile::{
    is_process_alive, read_pid_file, remove_pid_file, service_log_path, service_pid_path,
    terminate_process, write_pid_file, Termination,
};
use bf_core::ports::{BindProbe, ProbeResult};
use bf_core::process::{find_own_processes, ProcessInfo};
use bf_core::types::{InstanceSource, ServiceInstance};
use bf_core::SupervisorError;

/// File name of the job server binary
pub const SERVER_BIN: &str = "bidsflow-server";

/// How long `start` waits for the new instance to bind its port
const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(100);

/// Three-way status of one port, plus plain absence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running(u32),
    /// A PID file named a dead process; it has been removed
    StalePidfile,
    /// The port is bound by something this supervisor did not start
    PortOccupiedByOther,
    NotRunning,
}

/// A freshly started instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
    pub url: String,
    pub log_path: PathBuf,
    /// Whether the port was seen bound before `start` returned
    pub listening: bool,
}

/// Which instances `cleanup` terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Port(u16),
    All,
}

/// Program used to launch the service
#[derive(Debug, Clone)]
struct Launcher {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

/// Controls service instances for one state directory
pub struct Supervisor {
    config: ServiceConfig,
    config_path: Option<PathBuf>,
    launcher: Option<Launcher>,
}

impl Supervisor {
    /// Supervisor launching the `bidsflow-server` binary
    ///
    /// `config_path` is handed on to the server so both read the same file.
    pub fn new(config: ServiceConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            launcher: None,
        }
    }

    /// Supervisor launching `program leading_args.. --host H --port P`
    pub fn with_program(
        config: ServiceConfig,
        program: impl Into<PathBuf>,
        leading_args: Vec<OsString>,
    ) -> Self {
        Self {
            config,
            config_path: None,
            launcher: Some(Launcher {
                program: program.into(),
                leading_args,
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn pid_path(&self, port: u16) -> PathBuf {
        service_pid_path(&self.config.state_dir, port)
    }

    /// PID recorded for `port`, removing the file when it names a dead process
    fn live_pid(&self, port: u16) -> io::Result<Option<u32>> {
        let path = self.pid_path(port);
        let pid = match read_pid_file(&path) {
            Ok(pid) => pid,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("Removing unreadable PID file {:?}", path);
                remove_pid_file(&path)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match pid {
            Some(pid) if is_process_alive(pid) => Ok(Some(pid)),
            Some(pid) => {
                tracing::warn!("Removing stale PID file {:?} (PID {} is gone)", path, pid);
                remove_pid_file(&path)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Start an instance on `port` bound to `host`
    pub async fn start(&self, host: &str, port: u16) -> Result<Started, SupervisorError> {
        if let Some(pid) = self.live_pid(port)? {
            return Err(SupervisorError::AlreadyRunning { port, pid });
        }

        let probe = BindProbe::new(host);
        match probe.check(port) {
            ProbeResult::Bound => return Err(SupervisorError::PortInUse { port }),
            ProbeResult::Unavailable => {
                tracing::warn!("Cannot check whether {}:{} is free, starting anyway", host, port)
            }
            ProbeResult::Free => {}
        }

        let launcher = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => Launcher {
                program: resolve_server_bin(&self.config)?,
                leading_args: Vec::new(),
            },
        };

        fs::create_dir_all(&self.config.state_dir)?;
        let log_path = service_log_path(&self.config.state_dir, port);
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = Command::new(&launcher.program);
        cmd.args(&launcher.leading_args)
            .arg("--host")
            .arg(host)
            .arg("--port")
            .arg(port.to_string());
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        detach(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                SupervisorError::RuntimeNotFound(launcher.program.display().to_string())
            }
            _ => SupervisorError::Io(e),
        })?;
        let pid = child.id();
        write_pid_file(&self.pid_path(port), pid)?;
        tracing::info!("Started {:?} on {}:{} (PID {})", launcher.program, host, port, pid);

        // Wait for the port to be bound, or for an early exit
        let mut listening = false;
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                remove_pid_file(&self.pid_path(port))?;
                return Err(SupervisorError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "service exited immediately ({}); see {}",
                        status,
                        log_path.display()
                    ),
                )));
            }
            if probe.check(port) == ProbeResult::Bound {
                listening = true;
                break;
            }
            tokio::time::sleep(READY_POLL).await;
        }
        if !listening {
            tracing::warn!("PID {} is running but not yet listening on {}", pid, port);
        }

        // Reaps the child if it exits before we do. Not spawn_blocking:
        // runtime shutdown waits on those.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        let url = service_url(host, port);
        Ok(Started {
            pid,
            url,
            log_path,
            listening,
        })
    }

    /// Stop the instance on `port`; stopping a stopped service succeeds
    pub async fn stop(&self, port: u16) -> Result<Termination, SupervisorError> {
        let path = self.pid_path(port);
        let pid = match read_pid_file(&path) {
            Ok(pid) => pid,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => None,
            Err(e) => return Err(e.into()),
        };

        let outcome = match pid {
            Some(pid) => terminate_process(pid, self.config.stop_grace).await,
            None => Termination::NotRunning,
        };
        remove_pid_file(&path)?;

        match outcome {
            Termination::Survived => {
                tracing::warn!("Service on port {} survived termination", port)
            }
            other => tracing::info!("Service on port {}: {:?}", port, other),
        }
        Ok(outcome)
    }

    /// Status of `port`; a stale PID file is cleaned up as a side effect
    pub fn status(&self, host: &str, port: u16) -> Result<ServiceStatus, SupervisorError> {
        let recorded = read_pid_file(&self.pid_path(port)).unwrap_or(None);
        if let Some(pid) = self.live_pid(port)? {
            return Ok(ServiceStatus::Running(pid));
        }
        if BindProbe::new(host).check(port) == ProbeResult::Bound {
            return Ok(ServiceStatus::PortOccupiedByOther);
        }
        Ok(match recorded {
            Some(_) => ServiceStatus::StalePidfile,
            None => ServiceStatus::NotRunning,
        })
    }

    /// Stop, pause for the port to be released, then start
    pub async fn restart(&self, host: &str, port: u16) -> Result<Started, SupervisorError> {
        self.stop(port).await?;
        tokio::time::sleep(self.config.restart_delay).await;
        self.start(host, port).await
    }

    /// Every running instance owned by the current user
    ///
    /// Instances recorded in PID files come first; server processes found
    /// only in the process table are reported as orphans.
    pub async fn list(&self) -> Result<Vec<ServiceInstance>, SupervisorError> {
        let mut instances = self.recorded_instances()?;

        let orphans = tokio::task::spawn_blocking(|| find_own_processes(|p| server_port(p).is_some()))
            .await
            .map_err(|e| SupervisorError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        for process in orphans {
            if instances.iter().any(|i| i.pid == process.pid) {
                continue;
            }
            if let Some(port) = server_port(&process) {
                instances.push(ServiceInstance {
                    port,
                    pid: process.pid,
                    source: InstanceSource::Orphan,
                });
            }
        }

        instances.sort_by_key(|i| (i.port, i.pid));
        Ok(instances)
    }

    fn recorded_instances(&self) -> Result<Vec<ServiceInstance>, SupervisorError> {
        let entries = match fs::read_dir(&self.config.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(port) = pid_file_port(&entry.path()) else {
                continue;
            };
            match read_pid_file(&entry.path()) {
                Ok(Some(pid)) if is_process_alive(pid) => instances.push(ServiceInstance {
                    port,
                    pid,
                    source: InstanceSource::Pidfile,
                }),
                Ok(_) | Err(_) => tracing::debug!("Skipping stale PID file {:?}", entry.path()),
            }
        }
        Ok(instances)
    }

    /// Terminate instances, including those whose PID file was lost
    pub async fn cleanup(&self, scope: Scope) -> Result<Vec<ServiceInstance>, SupervisorError> {
        let targets: Vec<ServiceInstance> = self
            .list()
            .await?
            .into_iter()
            .filter(|i| match scope {
                Scope::Port(port) => i.port == port,
                Scope::All => true,
            })
            .collect();

        for instance in &targets {
            let outcome = terminate_process(instance.pid, self.config.stop_grace).await;
            tracing::info!(
                "Cleaned up {:?} instance on port {} (PID {}): {:?}",
                instance.source,
                instance.port,
                instance.pid,
                outcome
            );
            let path = self.pid_path(instance.port);
            if matches!(read_pid_file(&path), Ok(Some(pid)) if pid == instance.pid) {
                remove_pid_file(&path)?;
            }
        }
        Ok(targets)
    }
}

/// URL of a service bound to `host:port`, as seen from this host
pub fn service_url(host: &str, port: u16) -> String {
    ServiceConfig {
        host: host.to_string(),
        port,
        ..Default::default()
    }
    .url()
}

/// Port of a `bidsflow-server --port N` process
pub fn server_port(process: &ProcessInfo) -> Option<u16> {
    let program = process.program();
    let name = program.strip_suffix(".exe").unwrap_or(program);
    if name != SERVER_BIN {
        return None;
    }
    process.arg_value("--port")?.parse().ok()
}

/// Port encoded in a `service-<port>.pid` file name
fn pid_file_port(path: &Path) -> Option<u16> {
    path.file_name()?
        .to_str()?
        .strip_prefix("service-")?
        .strip_suffix(".pid")?
        .parse()
        .ok()
}

/// Locate the `bidsflow-server` binary
///
/// Order: configured path (or `BIDSFLOW_SERVER_BIN`), next to the running
/// executable, then `PATH`.
pub fn resolve_server_bin(config: &ServiceConfig) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = &config.server_bin {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(SupervisorError::RuntimeNotFound(path.display().to_string()));
    }

    let file_name = format!("{}{}", SERVER_BIN, std::env::consts::EXE_SUFFIX);
    if let Some(sibling) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .filter(|p| p.is_file())
    {
        return Ok(sibling);
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(&file_name))
                .find(|p| p.is_file())
        })
        .ok_or_else(|| {
            SupervisorError::RuntimeNotFound(format!(
                "{} (install it or set BIDSFLOW_SERVER_BIN)",
                SERVER_BIN
            ))
        })
}

/// Keep the service alive after the controlling terminal goes away
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

/// Best-effort browser launch; never blocks and never fails the caller
pub fn open_browser(url: &str) {
    if std::env::var_os("SSH_CONNECTION").is_some() {
        tracing::debug!("Running over SSH, not opening a browser");
        return;
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    if std::env::var_os("DISPLAY").is_none() && std::env::var_os("WAYLAND_DISPLAY").is_none() {
        tracing::debug!("No display available, not opening a browser");
        return;
    }

    let mut cmd = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", ""]);
        cmd
    } else {
        Command::new("xdg-open")
    };
    let spawned = cmd
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        tracing::debug!("Could not open a browser: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ServiceConfig {
        ServiceConfig {
            state_dir: dir.path().to_path_buf(),
            stop_grace: Duration::from_millis(500),
            restart_delay: Duration::from_millis(10),
            open_browser: false,
            ..Default::default()
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Stand-in service that just sleeps; the trailing flags land in `$@`
    #[cfg(unix)]
    fn sleeper(dir: &TempDir) -> Supervisor {
        Supervisor::with_program(
            config(dir),
            "/bin/sh",
            vec!["-c".into(), "exec sleep 30".into(), "sh".into()],
        )
    }

    #[test]
    fn test_pid_file_port() {
        assert_eq!(pid_file_port(Path::new("/x/service-18080.pid")), Some(18080));
        assert_eq!(pid_file_port(Path::new("service-18080.log")), None);
        assert_eq!(pid_file_port(Path::new("tunnel_pid")), None);
    }

    #[test]
    fn test_server_port() {
        let process = |cmd: &[&str]| ProcessInfo {
            pid: 1,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        };
        assert_eq!(
            server_port(&process(&["/opt/bin/bidsflow-server", "--host", "127.0.0.1", "--port", "18081"])),
            Some(18081)
        );
        assert_eq!(server_port(&process(&["bidsflow-server"])), None);
        assert_eq!(server_port(&process(&["python3", "--port", "8080"])), None);
    }

    #[test]
    fn test_missing_configured_binary() {
        let dir = TempDir::new().unwrap();
        let config = ServiceConfig {
            server_bin: Some(dir.path().join("nope")),
            ..Default::default()
        };
        assert!(matches!(
            resolve_server_bin(&config),
            Err(SupervisorError::RuntimeNotFound(_))
        ));
    }

    #[test]
    fn test_status_of_idle_port() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir), None);
        let port = free_port();
        assert_eq!(
            supervisor.status("127.0.0.1", port).unwrap(),
            ServiceStatus::NotRunning
        );
    }

    #[test]
    fn test_status_of_foreign_listener() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir), None);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            supervisor.status("127.0.0.1", port).unwrap(),
            ServiceStatus::PortOccupiedByOther
        );
    }

    #[test]
    fn test_stale_pid_file_is_cleaned() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir), None);
        let port = free_port();
        let path = service_pid_path(dir.path(), port);
        write_pid_file(&path, 999_999).unwrap();

        assert_eq!(
            supervisor.status("127.0.0.1", port).unwrap(),
            ServiceStatus::StalePidfile
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_start_refuses_bound_port() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir), None);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = supervisor.start("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortInUse { port: p } if p == port));
        assert!(!service_pid_path(dir.path(), port).exists());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_ok() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir), None);
        let port = free_port();
        assert_eq!(supervisor.stop(port).await.unwrap(), Termination::NotRunning);
        assert_eq!(supervisor.stop(port).await.unwrap(), Termination::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stop_cycle() {
        let dir = TempDir::new().unwrap();
        let supervisor = sleeper(&dir);
        let port = free_port();

        let started = supervisor.start("127.0.0.1", port).await.unwrap();
        // The stand-in never binds the port
        assert!(!started.listening);
        assert_eq!(
            supervisor.status("127.0.0.1", port).unwrap(),
            ServiceStatus::Running(started.pid)
        );

        let err = supervisor.start("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { pid, .. } if pid == started.pid));

        let listed = supervisor.list().await.unwrap();
        assert!(listed.iter().any(|i| i.pid == started.pid
            && i.port == port
            && i.source == InstanceSource::Pidfile));

        let outcome = supervisor.stop(port).await.unwrap();
        assert!(matches!(outcome, Termination::Exited | Termination::Killed));
        assert!(!service_pid_path(dir.path(), port).exists());
        assert_eq!(supervisor.stop(port).await.unwrap(), Termination::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::with_program(
            config(&dir),
            "/bin/sh",
            vec!["-c".into(), "echo boom >&2; exit 1".into(), "sh".into()],
        );
        let port = free_port();

        let err = supervisor.start("127.0.0.1", port).await.unwrap_err();
        assert!(err.to_string().contains("exited immediately"));
        assert!(!service_pid_path(dir.path(), port).exists());
        let log = fs::read_to_string(service_log_path(dir.path(), port)).unwrap();
        assert!(log.contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_by_port() {
        let dir = TempDir::new().unwrap();
        let supervisor = sleeper(&dir);
        let port = free_port();
        let started = supervisor.start("127.0.0.1", port).await.unwrap();

        let stopped = supervisor.cleanup(Scope::Port(port)).await.unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].pid, started.pid);
        assert!(!service_pid_path(dir.path(), port).exists());
    }
}
