//! bf-tunnel: reach a remote bidsflow job server from a laptop
//!
//! This crate provides:
//! - SSH remote execution with a one-shot authentication ladder
//! - Forwarding-channel spawning and PID recovery
//! - The persisted tunnel session record
//! - The health-check loop and the orchestrator driving a full start

pub mod forward;
pub mod health;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use forward::{ForwardSpec, Forwarder, SshForwarder};
pub use health::wait_healthy;
pub use orchestrator::{
    ChannelState, CleanupScope, Orchestrator, StartRequest, TunnelOutcome, TunnelPhase,
    TunnelStatus,
};
pub use prompt::{Interaction, NonInteractive, TerminalInteraction};
pub use session::{ChannelRecord, SessionStore, TunnelSession};
pub use ssh::{AuthMode, SshSession};
