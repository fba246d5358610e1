//! PID file and process signalling utilities
//!
//! PID files are namespaced by port (`service-<port>.pid`) so several
//! service instances can share one state directory. They are advisory
//! only: nothing stops a second process from binding the port between a
//! liveness check and the bind.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PID file path for the service instance on `port`
pub fn service_pid_path(state_dir: &Path, port: u16) -> PathBuf {
    state_dir.join(format!("service-{}.pid", port))
}

/// Log file path for the service instance on `port`
pub fn service_log_path(state_dir: &Path, port: u16) -> PathBuf {
    state_dir.join(format!("service-{}.log", port))
}

/// Read the PID from a PID file
///
/// Returns `Ok(Some(pid))` if the file exists and contains a valid PID,
/// `Ok(None)` if the file doesn't exist, or an error if the file is malformed.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a PID file, creating parent directories as needed
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove a PID file; a missing file is not an error
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID is still alive
///
/// Zombies count as alive until reaped.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // kill(pid, 0): ESRCH means gone, EPERM means alive but not ours
    unsafe {
        let result = libc::kill(pid as libc::pid_t, 0);
        if result == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        CloseHandle(handle);
        true
    }
}

/// Ask a process to exit (SIGTERM on unix)
#[cfg(unix)]
pub fn request_terminate(pid: u32) -> io::Result<()> {
    signal(pid, libc::SIGTERM)
}

/// Kill a process outright (SIGKILL on unix)
#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
pub fn request_terminate(pid: u32) -> io::Result<()> {
    // No graceful signal for arbitrary processes on Windows
    force_kill(pid)
}

#[cfg(windows)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        let ok = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Outcome of [`terminate_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running under that PID
    NotRunning,
    /// The process exited within the grace period
    Exited,
    /// The process had to be killed forcefully
    Killed,
    /// The process survived both signals (e.g. owned by another user)
    Survived,
}

/// Graceful-then-forceful termination
///
/// Sends a termination request, polls for exit during `grace`, then
/// escalates to a forceful kill.
pub async fn terminate_process(pid: u32, grace: Duration) -> Termination {
    if !is_process_alive(pid) {
        return Termination::NotRunning;
    }

    if let Err(e) = request_terminate(pid) {
        tracing::debug!("Terminate request to PID {} failed: {}", pid, e);
    }

    if wait_for_exit(pid, grace).await {
        return Termination::Exited;
    }

    tracing::warn!("PID {} still alive after {:?}, killing", pid, grace);
    if let Err(e) = force_kill(pid) {
        tracing::debug!("Kill of PID {} failed: {}", pid, e);
    }

    if wait_for_exit(pid, Duration::from_millis(500)).await {
        Termination::Killed
    } else {
        Termination::Survived
    }
}

/// Poll until the process exits or `timeout` elapses
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let step = Duration::from_millis(50);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
    }
}

/// Guard that removes the PID file when dropped
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create a new guard and write the PID file
    pub fn new(path: PathBuf, pid: u32) -> io::Result<Self> {
        write_pid_file(&path, pid)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        // Only remove a file that still names this process
        match read_pid_file(&self.path) {
            Ok(Some(pid)) if pid != std::process::id() => return,
            _ => {}
        }
        if let Err(e) = remove_pid_file(&self.path) {
            tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}
