//! Tunnel Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use super::env_var;
use super::serde_utils::{duration_secs, port_range};
use super::service::DEFAULT_STATE_DIR;

/// Configuration for `tunnel-ctl`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Candidate range for the remote service port
    #[serde(with = "port_range")]
    pub remote_port_range: RangeInclusive<u16>,

    /// First local port tried for the forwarding channel
    pub local_port: u16,

    /// Maximum number of health probes
    pub health_attempts: u32,

    /// Pause between health probes
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,

    /// SSH connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Supervisor command run on the remote host (inside the remote path)
    pub remote_service_ctl: String,

    /// Time between SIGTERM and SIGKILL when closing the channel
    #[serde(with = "duration_secs")]
    pub kill_grace: Duration,

    /// Directory holding the session records
    pub state_dir: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote_port_range: 18080..=18150,
            local_port: 8080,
            health_attempts: 20,
            health_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            remote_service_ctl: "service-ctl".to_string(),
            kill_grace: Duration::from_secs(2),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl TunnelConfig {
    /// Apply the `BIDSFLOW_STATE_DIR` override
    pub fn apply_env(&mut self) {
        if let Some(dir) = env_var("BIDSFLOW_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
    }

    /// Port returned when no probing mechanism works on the remote host
    pub fn fallback_remote_port(&self) -> u16 {
        *self.remote_port_range.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_range() {
        let config = TunnelConfig::default();
        assert_eq!(config.remote_port_range, 18080..=18150);
        assert_eq!(config.fallback_remote_port(), 18080);
    }
}
