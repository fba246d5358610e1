//! Persisted tunnel session
//!
//! Three small text files in the state directory let later `stop`,
//! `status` and `list` calls run without repeating connection details:
//!
//! - `tunnel_target`: SSH target on line 1, remote checkout path on line 2
//! - `tunnel_remote_port`: the remote service port
//! - `tunnel_pid`: forwarding process id (or `unknown`) on line 1, local
//!   port on line 2

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bf_core::{BfError, TunnelError};

use crate::orchestrator::DEFAULT_REMOTE_PATH;

const TARGET_FILE: &str = "tunnel_target";
const REMOTE_PORT_FILE: &str = "tunnel_remote_port";
const CHANNEL_FILE: &str = "tunnel_pid";
const UNKNOWN_PID: &str = "unknown";

/// Recorded forwarding channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRecord {
    /// `None` when the process could not be located after spawning
    pub pid: Option<u32>,
    pub local_port: u16,
}

/// Everything known about the last tunnel of this working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    pub target: String,
    pub remote_path: String,
    pub remote_port: Option<u16>,
    pub channel: Option<ChannelRecord>,
}

/// Reads and writes the session files of one state directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the session, `None` when no target was ever recorded
    pub fn load(&self) -> io::Result<Option<TunnelSession>> {
        let Some(content) = self.read(TARGET_FILE)? else {
            return Ok(None);
        };
        let mut lines = content.lines().map(str::trim);
        let target = lines.next().unwrap_or_default().to_string();
        if target.is_empty() {
            return Ok(None);
        }
        let remote_path = lines.next().unwrap_or_default().to_string();

        Ok(Some(TunnelSession {
            target,
            remote_path,
            remote_port: self.load_remote_port()?,
            channel: self.load_channel()?,
        }))
    }

    /// Fill in the target and remote path from the recorded session
    ///
    /// An explicit target keeps the recorded path only if it is the same
    /// host.
    pub fn resolve_target(
        &self,
        target: Option<String>,
        remote_path: Option<String>,
    ) -> Result<(String, String), BfError> {
        let recorded = self.load()?;
        let target = match (target, &recorded) {
            (Some(target), _) => target,
            (None, Some(session)) => session.target.clone(),
            (None, None) => return Err(TunnelError::NoSession.into()),
        };
        let remote_path = remote_path
            .or_else(|| {
                recorded
                    .filter(|s| s.target == target && !s.remote_path.is_empty())
                    .map(|s| s.remote_path)
            })
            .unwrap_or_else(|| DEFAULT_REMOTE_PATH.to_string());
        Ok((target, remote_path))
    }

    pub fn load_remote_port(&self) -> io::Result<Option<u16>> {
        Ok(self
            .read(REMOTE_PORT_FILE)?
            .and_then(|s| s.trim().parse().ok()))
    }

    pub fn load_channel(&self) -> io::Result<Option<ChannelRecord>> {
        let Some(content) = self.read(CHANNEL_FILE)? else {
            return Ok(None);
        };
        let mut lines = content.lines().map(str::trim);
        let pid = match lines.next() {
            Some(UNKNOWN_PID) => None,
            Some(value) => match value.parse() {
                Ok(pid) => Some(pid),
                Err(_) => {
                    tracing::warn!("Ignoring malformed channel record in {:?}", self.dir);
                    return Ok(None);
                }
            },
            None => return Ok(None),
        };
        let Some(local_port) = lines.next().and_then(|s| s.parse().ok()) else {
            tracing::warn!("Channel record in {:?} has no local port", self.dir);
            return Ok(None);
        };
        Ok(Some(ChannelRecord { pid, local_port }))
    }

    /// Record the connection target
    ///
    /// Switching to a different target forgets the remote port, since it
    /// belongs to another host.
    pub fn save_target(&self, target: &str, remote_path: &str) -> io::Result<()> {
        if let Some(previous) = self.load()? {
            if previous.target != target {
                self.remove(REMOTE_PORT_FILE)?;
            }
        }
        self.write(TARGET_FILE, &format!("{}\n{}\n", target, remote_path))
    }

    pub fn save_remote_port(&self, port: u16) -> io::Result<()> {
        self.write(REMOTE_PORT_FILE, &format!("{}\n", port))
    }

    pub fn save_channel(&self, record: ChannelRecord) -> io::Result<()> {
        let pid = record
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| UNKNOWN_PID.to_string());
        self.write(CHANNEL_FILE, &format!("{}\n{}\n", pid, record.local_port))
    }

    pub fn clear_channel(&self) -> io::Result<()> {
        self.remove(CHANNEL_FILE)
    }

    /// Log file receiving the forwarding tool's stderr
    pub fn forward_log_path(&self) -> PathBuf {
        self.dir.join("tunnel_ssh.log")
    }

    fn read(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.dir.join(name)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, name: &str, content: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(name), content)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
