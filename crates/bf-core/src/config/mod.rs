//! Configuration management for bidsflow
//!
//! One TOML file carries three sections, `[server]`, `[service]` and
//! `[tunnel]`. Every field has a default so a missing file or a partial
//! file is valid.

mod serde_utils;
mod server;
mod service;
mod tunnel;

pub use serde_utils::{duration_secs, port_range};
pub use server::ServerConfig;
pub use service::ServiceConfig;
pub use tunnel::TunnelConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Name of the per-checkout configuration file
pub const LOCAL_CONFIG_NAME: &str = "bidsflow.toml";

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerConfig,
    pub service: ServiceConfig,
    pub tunnel: TunnelConfig,
}

impl ConfigFile {
    /// Apply environment variable overrides to every section
    pub fn apply_env(&mut self) {
        self.server.apply_env();
        self.service.apply_env();
        self.tunnel.apply_env();
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bidsflow")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Pick the configuration file to use
///
/// An explicit path always wins, then `./bidsflow.toml`, then the file in
/// the platform config directory. Returns `None` when nothing exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_NAME);
    if local.exists() {
        return Some(local);
    }
    let global = default_config_path();
    global.exists().then_some(global)
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Load the full configuration, falling back to defaults
///
/// An explicitly requested file must exist; an implicit one is optional.
/// Environment overrides are applied last.
pub fn load_config_file(explicit: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => {
            tracing::debug!("Loading configuration from {:?}", path);
            load_config::<ConfigFile>(&path)?
        }
        None => {
            tracing::debug!("No configuration file found, using defaults");
            ConfigFile::default()
        }
    };
    config.apply_env();
    Ok(config)
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bidsflow.toml");
        std::fs::write(
            &path,
            r#"
[service]
port = 9090

[tunnel]
remote_port_range = [19000, 19010]
"#,
        )
        .unwrap();

        let config: ConfigFile = load_config(&path).unwrap();
        assert_eq!(config.service.port, 9090);
        assert_eq!(config.service.host, "127.0.0.1");
        assert_eq!(*config.tunnel.remote_port_range.start(), 19000);
        assert_eq!(*config.tunnel.remote_port_range.end(), 19010);
        assert_eq!(config.tunnel.local_port, 8080);
        assert_eq!(config.server.converter, PathBuf::from("bidsify.py"));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let result = load_config_file(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ConfigFile::default();
        config.tunnel.health_attempts = 5;
        save_config(&path, &config).unwrap();

        let loaded: ConfigFile = load_config(&path).unwrap();
        assert_eq!(loaded.tunnel.health_attempts, 5);
        assert_eq!(loaded.service.port, config.service.port);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[service\nport = ").unwrap();
        let result: Result<ConfigFile, _> = load_config(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
