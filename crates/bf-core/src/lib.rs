//! bf-core: Core types and process utilities for bidsflow
//!
//! Shared by the job server, the tunnel orchestrator and the command-line
//! tools: the job model, the error taxonomy with its exit codes, layered
//! configuration, PID files, the port allocator and the remote execution
//! boundary.

pub mod config;
pub mod error;
pub mod pidfile;
pub mod ports;
pub mod process;
pub mod remote;
pub mod time;
pub mod types;

pub use error::{BfError, ConfigError, JobError, PortError, SupervisorError, TunnelError};
pub use remote::{ExecOutput, RemoteExec};
pub use types::{Action, JobId, JobStatus, LogEntry, LogStream, ServiceInstance};
