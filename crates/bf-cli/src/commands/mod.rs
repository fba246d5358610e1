//! CLI command implementations
//!
//! Each command prints its own report and returns the process exit code;
//! classified failures come back as [`bf_core::BfError`].

pub mod jobs;
pub mod service;
pub mod tunnel;
