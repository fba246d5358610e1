//! bf-server: job server for bidsflow
//!
//! This crate runs conversion jobs as subprocesses and exposes their
//! lifecycle over HTTP, with a WebSocket push channel for live logs.

pub mod api;
pub mod jobs;
pub mod state;

pub use jobs::JobManager;
pub use state::ServerState;
