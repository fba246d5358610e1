//! Process Supervisor configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::env_var;
use super::serde_utils::duration_secs;

/// Default directory (relative to the working directory) for PID files,
/// service logs and tunnel session records
pub const DEFAULT_STATE_DIR: &str = ".bidsflow";

/// Configuration for `service-ctl`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the service binds to
    pub host: String,

    /// Port the service binds to
    pub port: u16,

    /// Explicit path of the `bidsflow-server` binary
    pub server_bin: Option<PathBuf>,

    /// Directory holding PID files and per-port logs
    pub state_dir: PathBuf,

    /// Time between SIGTERM and SIGKILL on stop
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,

    /// Pause between stop and start on restart
    #[serde(with = "duration_secs")]
    pub restart_delay: Duration,

    /// Open a browser after starting on a loopback address
    pub open_browser: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            server_bin: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            stop_grace: Duration::from_secs(3),
            restart_delay: Duration::from_secs(1),
            open_browser: true,
        }
    }
}

impl ServiceConfig {
    /// Apply `BIDSFLOW_HOST`, `BIDSFLOW_PORT`, `BIDSFLOW_SERVER_BIN` and
    /// `BIDSFLOW_STATE_DIR` overrides
    pub fn apply_env(&mut self) {
        if let Some(host) = env_var("BIDSFLOW_HOST") {
            self.host = host;
        }
        if let Some(port) = env_var("BIDSFLOW_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring invalid BIDSFLOW_PORT={}", port),
            }
        }
        if let Some(bin) = env_var("BIDSFLOW_SERVER_BIN") {
            self.server_bin = Some(PathBuf::from(bin));
        }
        if let Some(dir) = env_var("BIDSFLOW_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
    }

    /// URL of the service as seen from this host
    pub fn url(&self) -> String {
        let host = if self.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        format!("http://{}:{}", host, self.port)
    }

    /// Whether the service binds to a loopback address only
    pub fn is_loopback(&self) -> bool {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => ip.is_loopback(),
            Err(_) => self.host == "localhost",
        }
    }
}
