//! Error taxonomy for bidsflow
//!
//! Every distinct failure a command-line front end can hit maps to one
//! stable exit code through [`BfError::exit_code`], so calling tooling can
//! branch on it.

use std::path::PathBuf;
use thiserror::Error;

/// Stable process exit codes
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const PORT_IN_USE: i32 = 3;
    pub const ALREADY_RUNNING: i32 = 4;
    pub const RUNTIME_NOT_FOUND: i32 = 5;
    pub const AUTH_FAILED: i32 = 6;
    pub const HEALTH_TIMEOUT: i32 = 7;
    pub const TOOL_MISSING: i32 = 8;
    pub const LOCAL_PORT_CONFLICT: i32 = 9;
    pub const TUNNEL_UNVERIFIED: i32 = 10;
    pub const REMOTE_START_FAILED: i32 = 11;
    pub const CONNECTION: i32 = 12;
    pub const NO_SESSION: i32 = 13;
    pub const INVALID_ACTION: i32 = 14;
    pub const JOB_NOT_FOUND: i32 = 15;
    pub const PORTS_EXHAUSTED: i32 = 16;
}

/// Top-level error type for the bidsflow tools
#[derive(Error, Debug)]
pub enum BfError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BfError {
    /// Exit code a command-line tool reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BfError::Supervisor(e) => match e {
                SupervisorError::PortInUse { .. } => exit::PORT_IN_USE,
                SupervisorError::AlreadyRunning { .. } => exit::ALREADY_RUNNING,
                SupervisorError::RuntimeNotFound(_) => exit::RUNTIME_NOT_FOUND,
                SupervisorError::Io(_) => exit::FAILURE,
            },
            BfError::Job(e) => match e {
                JobError::InvalidAction(_) => exit::INVALID_ACTION,
                JobError::NotFound(_) => exit::JOB_NOT_FOUND,
                _ => exit::FAILURE,
            },
            BfError::Port(PortError::Exhausted { .. }) => exit::PORTS_EXHAUSTED,
            BfError::Tunnel(e) => match e {
                TunnelError::AuthenticationFailed(_) => exit::AUTH_FAILED,
                TunnelError::HealthCheckTimeout { .. } => exit::HEALTH_TIMEOUT,
                TunnelError::ToolMissing(_) => exit::TOOL_MISSING,
                TunnelError::LocalPortConflict(_) => exit::LOCAL_PORT_CONFLICT,
                TunnelError::RemotePortInUse(_) => exit::PORT_IN_USE,
                TunnelError::RemoteStartFailed { .. } => exit::REMOTE_START_FAILED,
                TunnelError::NoSession => exit::NO_SESSION,
                TunnelError::Connection(_) | TunnelError::Exec(_) => exit::CONNECTION,
                TunnelError::Port(PortError::Exhausted { .. }) => exit::PORTS_EXHAUSTED,
            },
            BfError::Config(_) | BfError::Io(_) => exit::FAILURE,
        }
    }
}

/// Process Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The port is bound by a process this supervisor does not own
    #[error("Port {port} is already in use by another process")]
    PortInUse { port: u16 },

    /// A live service instance is already recorded for the port
    #[error("Service already running on port {port} (PID {pid})")]
    AlreadyRunning { port: u16, pid: u32 },

    /// The service binary could not be located
    #[error("Service runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job Manager errors
#[derive(Error, Debug)]
pub enum JobError {
    /// Action outside the closed set analyse | run | report
    #[error("Invalid action '{0}' (expected analyse, run or report)")]
    InvalidAction(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    /// Missing, unreadable or out-of-root config reference
    #[error("Invalid config reference: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn subprocess: {0}")]
    SubprocessSpawnFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Port Allocator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port of the probed range answered as bound
    #[error("No free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Tunnel Orchestrator errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("SSH authentication to {0} failed")]
    AuthenticationFailed(String),

    /// The health endpoint never answered `ok: true` within the attempt bound
    #[error("Remote service did not become healthy after {attempts} attempts ({last})")]
    HealthCheckTimeout { attempts: u32, last: String },

    /// A required external tool is not installed
    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    #[error("Local port {0} is already in use")]
    LocalPortConflict(u16),

    #[error("Remote port {0} is already in use")]
    RemotePortInUse(u16),

    #[error("Failed to start remote service (exit {code}): {message}")]
    RemoteStartFailed { code: i32, message: String },

    /// No persisted session and no explicit target
    #[error("No tunnel session recorded; pass a target explicitly")]
    NoSession,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Remote command failed: {0}")]
    Exec(String),

    #[error(transparent)]
    Port(#[from] PortError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
