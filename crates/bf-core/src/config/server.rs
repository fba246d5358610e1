//! Job server configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::env_var;
use super::serde_utils::duration_secs;

/// Configuration for the job server (`bidsflow-server`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory every server-side config path must resolve inside
    pub root: PathBuf,

    /// Conversion tool, relative to `root` unless absolute
    pub converter: PathBuf,

    /// Interpreter used when the converter is a script
    pub python: String,

    /// Per-job working directories, relative to `root` unless absolute
    pub jobs_dir: PathBuf,

    /// Files probed after each job, relative to `root` unless absolute
    pub extra_artifacts: Vec<PathBuf>,

    /// Time a stopped job gets between SIGTERM and SIGKILL
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,

    /// How long terminal jobs are kept in memory
    #[serde(with = "duration_secs")]
    pub job_retention: Duration,

    /// Interval between retention sweeps
    #[serde(with = "duration_secs")]
    pub retention_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            converter: PathBuf::from("bidsify.py"),
            python: "python3".to_string(),
            jobs_dir: PathBuf::from("logs").join("jobs"),
            extra_artifacts: vec![
                PathBuf::from("logs").join("bids_conversion.tsv"),
                PathBuf::from("logs").join("bids_results.json"),
            ],
            stop_grace: Duration::from_secs(1),
            job_retention: Duration::from_secs(24 * 3600),
            retention_interval: Duration::from_secs(600),
        }
    }
}

impl ServerConfig {
    /// Apply `PYTHON` and `BIDSFLOW_CONVERTER` overrides
    pub fn apply_env(&mut self) {
        if let Some(python) = env_var("PYTHON") {
            self.python = python;
        }
        if let Some(converter) = env_var("BIDSFLOW_CONVERTER") {
            self.converter = PathBuf::from(converter);
        }
    }

    /// Resolve a configured path against `root`
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Absolute location of the converter
    pub fn converter_path(&self) -> PathBuf {
        self.resolve(&self.converter)
    }

    /// Absolute location of the per-job directories
    pub fn jobs_path(&self) -> PathBuf {
        self.resolve(&self.jobs_dir)
    }
}
