//! Tunnel Orchestrator
//!
//! Drives one tunnel from nothing to a usable local URL:
//!
//! ```text
//! idle -> starting-remote -> waiting-health -> selecting-local-port
//!      -> tunneling -> active -> stopping -> idle
//! ```
//!
//! Every remote step goes through [`RemoteExec`], every local process step
//! through [`Forwarder`], so the whole flow runs against fakes in tests.

use std::fmt;

use serde::Deserialize;

use bf_core::config::TunnelConfig;
use bf_core::pidfile::Termination;
use bf_core::ports::{find_free_port, probe_port, CommandProbe, PortProbe, ProbeResult};
use bf_core::remote::shell_quote;
use bf_core::{
    BfError, ExecOutput, PortError, RemoteExec, ServiceInstance, TunnelError,
};

use crate::forward::{ForwardSpec, Forwarder};
use crate::health::wait_healthy;
use crate::prompt::Interaction;
use crate::session::{ChannelRecord, SessionStore, TunnelSession};

/// Remote path used when none was given and none was recorded
pub const DEFAULT_REMOTE_PATH: &str = ".";

/// Local ports tried after an occupied one in auto-port mode
const LOCAL_PORT_SPAN: u16 = 100;

/// Times the user is asked for another local port
const MAX_PORT_PROMPTS: u32 = 3;

/// Exit codes of the remote supervisor that carry meaning here
const REMOTE_PORT_IN_USE: i32 = 3;
const REMOTE_ALREADY_RUNNING: i32 = 4;

/// Where a tunnel start currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    Idle,
    StartingRemote,
    WaitingHealth,
    SelectingLocalPort,
    Tunneling,
    Active,
    Stopping,
}

impl fmt::Display for TunnelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelPhase::Idle => "idle",
            TunnelPhase::StartingRemote => "starting-remote",
            TunnelPhase::WaitingHealth => "waiting-health",
            TunnelPhase::SelectingLocalPort => "selecting-local-port",
            TunnelPhase::Tunneling => "tunneling",
            TunnelPhase::Active => "active",
            TunnelPhase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Parameters of [`Orchestrator::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub target: String,
    pub remote_path: String,
    /// Explicit remote port; allocated from the configured range otherwise
    pub remote_port: Option<u16>,
    /// First local port to try; the configured default otherwise
    pub local_port: Option<u16>,
    /// Move to the next free port instead of failing or asking
    pub auto_port: bool,
    pub autossh: bool,
}

/// Result of a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOutcome {
    pub target: String,
    pub remote_port: u16,
    pub local_port: u16,
    /// `None` when the channel runs but its PID could not be recovered
    pub channel_pid: Option<u32>,
}

impl TunnelOutcome {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

/// State of the recorded forwarding channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Alive { pid: u32, local_port: u16 },
    Dead { pid: u32, local_port: u16 },
    /// Recorded without a PID, so liveness cannot be checked
    Unverified { local_port: u16 },
    None,
}

/// Answer of [`Orchestrator::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub session: TunnelSession,
    pub channel: ChannelState,
    /// Whether the remote service answers, when it was asked
    pub remote_running: Option<bool>,
}

/// What [`Orchestrator::cleanup`] should terminate on the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupScope {
    Port(u16),
    All,
}

/// Drives tunnel sessions of one working directory
pub struct Orchestrator<F: Forwarder> {
    config: TunnelConfig,
    store: SessionStore,
    forwarder: F,
    interaction: Box<dyn Interaction>,
    local_probes: Vec<Box<dyn PortProbe>>,
    phase: TunnelPhase,
}

impl<F: Forwarder> Orchestrator<F> {
    pub fn new(
        config: TunnelConfig,
        store: SessionStore,
        forwarder: F,
        interaction: Box<dyn Interaction>,
        local_probes: Vec<Box<dyn PortProbe>>,
    ) -> Self {
        Self {
            config,
            store,
            forwarder,
            interaction,
            local_probes,
            phase: TunnelPhase::Idle,
        }
    }

    pub fn phase(&self) -> TunnelPhase {
        self.phase
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn enter(&mut self, phase: TunnelPhase) {
        tracing::debug!("Tunnel {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Fill in the target and remote path from the recorded session
    pub fn resolve_target(
        &self,
        target: Option<String>,
        remote_path: Option<String>,
    ) -> Result<(String, String), BfError> {
        self.store.resolve_target(target, remote_path)
    }

    /// Start (or reuse) the remote service and open a channel to it
    pub async fn start(
        &mut self,
        exec: &dyn RemoteExec,
        request: StartRequest,
    ) -> Result<TunnelOutcome, BfError> {
        self.forwarder.check_tools(request.autossh)?;

        // Never leave an old channel behind
        self.stop_channel().await?;

        let previous = self.store.load()?;
        self.store.save_target(&request.target, &request.remote_path)?;

        self.enter(TunnelPhase::StartingRemote);
        let explicit = request.remote_port.is_some();
        let mut remote_port = match request.remote_port {
            Some(port) => port,
            None => {
                let recorded = previous
                    .filter(|s| s.target == request.target)
                    .and_then(|s| s.remote_port);
                self.select_remote_port(exec, &request.remote_path, recorded)
                    .await?
            }
        };
        self.store.save_remote_port(remote_port)?;

        let mut retried = false;
        loop {
            let output = exec
                .run(&self.remote_ctl(&request.remote_path, &start_args(remote_port)))
                .await?;
            match output.exit_code {
                0 => {
                    tracing::info!("Remote service started on port {}", remote_port);
                    break;
                }
                REMOTE_ALREADY_RUNNING => {
                    tracing::info!("Remote service already running on port {}", remote_port);
                    break;
                }
                REMOTE_PORT_IN_USE if (!explicit || request.auto_port) && !retried => {
                    tracing::warn!(
                        "Remote port {} was taken before the service could bind it, trying another",
                        remote_port
                    );
                    retried = true;
                    remote_port = self.allocate_after(exec, remote_port).await?;
                    self.store.save_remote_port(remote_port)?;
                }
                REMOTE_PORT_IN_USE => {
                    self.enter(TunnelPhase::Idle);
                    return Err(TunnelError::RemotePortInUse(remote_port).into());
                }
                code => {
                    self.enter(TunnelPhase::Idle);
                    return Err(TunnelError::RemoteStartFailed {
                        code,
                        message: self.describe_remote_failure(&output),
                    }
                    .into());
                }
            }
        }

        self.enter(TunnelPhase::WaitingHealth);
        if let Err(e) = wait_healthy(
            exec,
            remote_port,
            self.config.health_attempts,
            self.config.health_interval,
        )
        .await
        {
            self.enter(TunnelPhase::Idle);
            return Err(e.into());
        }

        self.enter(TunnelPhase::SelectingLocalPort);
        let desired = request.local_port.unwrap_or(self.config.local_port);
        let local_port = match self.select_local_port(desired, request.auto_port).await {
            Ok(port) => port,
            Err(e) => {
                self.enter(TunnelPhase::Idle);
                return Err(e);
            }
        };

        self.enter(TunnelPhase::Tunneling);
        let spec = ForwardSpec {
            target: request.target.clone(),
            local_port,
            remote_port,
            autossh: request.autossh,
        };
        let channel_pid = match self.forwarder.open(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                self.enter(TunnelPhase::Idle);
                return Err(e.into());
            }
        };
        self.store.save_channel(ChannelRecord {
            pid: channel_pid,
            local_port,
        })?;
        if channel_pid.is_none() {
            tracing::warn!(
                "Forwarding on local port {} started but its process could not be found; it cannot be verified or stopped automatically",
                local_port
            );
        }

        self.enter(TunnelPhase::Active);
        Ok(TunnelOutcome {
            target: request.target,
            remote_port,
            local_port,
            channel_pid,
        })
    }

    /// Close the recorded channel, if any, and forget it
    pub async fn stop_channel(&mut self) -> Result<Option<Termination>, BfError> {
        let Some(record) = self.store.load_channel()? else {
            return Ok(None);
        };

        let outcome = match record.pid {
            Some(pid) if self.forwarder.is_alive(pid) => {
                self.enter(TunnelPhase::Stopping);
                let result = self.forwarder.close(pid, self.config.kill_grace).await;
                tracing::info!("Closed forwarding channel PID {} ({:?})", pid, result);
                if result == Termination::Survived {
                    tracing::warn!("Forwarding channel PID {} survived termination", pid);
                }
                Some(result)
            }
            Some(pid) => {
                tracing::info!("Forwarding channel PID {} already gone", pid);
                Some(Termination::NotRunning)
            }
            None => {
                tracing::warn!(
                    "No PID recorded for the channel on local port {}; it may still be running",
                    record.local_port
                );
                None
            }
        };

        self.store.clear_channel()?;
        self.enter(TunnelPhase::Idle);
        Ok(outcome)
    }

    /// Stop the remote service instance on `port`
    pub async fn stop_remote(
        &self,
        exec: &dyn RemoteExec,
        remote_path: &str,
        port: u16,
    ) -> Result<(), BfError> {
        let output = exec
            .run(&self.remote_ctl(remote_path, &format!("stop --port {}", port)))
            .await?;
        if !output.success() {
            return Err(TunnelError::Exec(self.describe_remote_failure(&output)).into());
        }
        tracing::info!("Stopped remote service on port {}", port);
        Ok(())
    }

    /// Ask the user before stopping the remote service
    pub fn confirm_remote_stop(&self, port: u16) -> bool {
        self.interaction.confirm(&format!(
            "Also stop the remote service on port {}?",
            port
        ))
    }

    /// Recorded session, channel liveness and optionally the remote state
    pub async fn status(&self, exec: Option<&dyn RemoteExec>) -> Result<TunnelStatus, BfError> {
        let session = self.store.load()?.ok_or(TunnelError::NoSession)?;

        let channel = match session.channel {
            None => ChannelState::None,
            Some(ChannelRecord {
                pid: None,
                local_port,
            }) => ChannelState::Unverified { local_port },
            Some(ChannelRecord {
                pid: Some(pid),
                local_port,
            }) => {
                if self.forwarder.is_alive(pid) {
                    ChannelState::Alive { pid, local_port }
                } else {
                    ChannelState::Dead { pid, local_port }
                }
            }
        };

        let remote_running = match (exec, session.remote_port) {
            (Some(exec), Some(port)) => {
                Some(self.remote_running(exec, &session.remote_path, port).await?)
            }
            _ => None,
        };

        Ok(TunnelStatus {
            session,
            channel,
            remote_running,
        })
    }

    /// Service instances of the remote user
    pub async fn list(
        &self,
        exec: &dyn RemoteExec,
        remote_path: &str,
    ) -> Result<Vec<ServiceInstance>, BfError> {
        let output = exec.run(&self.remote_ctl(remote_path, "list --json")).await?;
        if !output.success() {
            return Err(TunnelError::Exec(self.describe_remote_failure(&output)).into());
        }
        serde_json::from_str(output.stdout.trim()).map_err(|e| {
            TunnelError::Exec(format!("unreadable instance list from {}: {}", exec.host(), e))
                .into()
        })
    }

    /// Terminate remote instances, including ones whose PID file is lost
    pub async fn cleanup(
        &self,
        exec: &dyn RemoteExec,
        remote_path: &str,
        scope: CleanupScope,
    ) -> Result<Vec<ServiceInstance>, BfError> {
        let args = match scope {
            CleanupScope::Port(port) => format!("cleanup --port {} --json", port),
            CleanupScope::All => "cleanup --all --json".to_string(),
        };
        let output = exec.run(&self.remote_ctl(remote_path, &args)).await?;
        if !output.success() {
            return Err(TunnelError::Exec(self.describe_remote_failure(&output)).into());
        }
        let stopped: Vec<ServiceInstance> =
            serde_json::from_str(output.stdout.trim()).unwrap_or_default();
        Ok(stopped)
    }

    /// Reuse the recorded port when it still serves, otherwise allocate
    async fn select_remote_port(
        &self,
        exec: &dyn RemoteExec,
        remote_path: &str,
        recorded: Option<u16>,
    ) -> Result<u16, BfError> {
        if let Some(port) = recorded {
            if self.remote_running(exec, remote_path, port).await? {
                tracing::info!("Reusing current remote port {}", port);
                return Ok(port);
            }
            tracing::debug!("Recorded remote port {} is not serving", port);
        }

        let probes = CommandProbe::ladder(exec);
        let allocation = find_free_port(
            self.config.remote_port_range.clone(),
            &probes,
            self.config.fallback_remote_port(),
        )
        .await
        .map_err(TunnelError::from)?;
        if allocation.is_verified() {
            tracing::info!("Allocated new remote port {}", allocation.port);
        } else {
            tracing::warn!(
                "No port probing tool works on {}; using port {} unverified",
                exec.host(),
                allocation.port
            );
        }
        Ok(allocation.port)
    }

    /// Allocate from the part of the range after `taken`
    async fn allocate_after(&self, exec: &dyn RemoteExec, taken: u16) -> Result<u16, BfError> {
        let end = *self.config.remote_port_range.end();
        let start = taken.saturating_add(1).max(*self.config.remote_port_range.start());
        if taken >= end {
            return Err(TunnelError::Port(PortError::Exhausted {
                start: *self.config.remote_port_range.start(),
                end,
            })
            .into());
        }
        let probes = CommandProbe::ladder(exec);
        let allocation = find_free_port(start..=end, &probes, start)
            .await
            .map_err(TunnelError::from)?;
        Ok(allocation.port)
    }

    async fn remote_running(
        &self,
        exec: &dyn RemoteExec,
        remote_path: &str,
        port: u16,
    ) -> Result<bool, BfError> {
        let output = exec
            .run(&self.remote_ctl(remote_path, &format!("status --port {}", port)))
            .await?;
        Ok(output.success())
    }

    /// First usable local port at or after `desired`
    async fn select_local_port(&self, desired: u16, auto_port: bool) -> Result<u16, BfError> {
        match probe_port(desired, &self.local_probes).await {
            ProbeResult::Free => return Ok(desired),
            ProbeResult::Unavailable => {
                tracing::warn!("Cannot probe local port {}; assuming it is free", desired);
                return Ok(desired);
            }
            ProbeResult::Bound => {}
        }

        if auto_port {
            if desired == u16::MAX {
                return Err(TunnelError::LocalPortConflict(desired).into());
            }
            let range = desired + 1..=desired.saturating_add(LOCAL_PORT_SPAN);
            let allocation = find_free_port(range, &self.local_probes, desired)
                .await
                .map_err(TunnelError::from)?;
            if !allocation.is_verified() {
                return Err(TunnelError::LocalPortConflict(desired).into());
            }
            tracing::info!(
                "Local port {} in use, using {} instead",
                desired,
                allocation.port
            );
            return Ok(allocation.port);
        }

        let mut busy = desired;
        for _ in 0..MAX_PORT_PROMPTS {
            let Some(candidate) = self.interaction.alternate_port(busy) else {
                break;
            };
            match probe_port(candidate, &self.local_probes).await {
                ProbeResult::Bound => busy = candidate,
                _ => return Ok(candidate),
            }
        }
        Err(TunnelError::LocalPortConflict(busy).into())
    }

    fn remote_ctl(&self, remote_path: &str, args: &str) -> String {
        format!(
            "cd {} && {} {}",
            shell_quote(remote_path),
            self.config.remote_service_ctl,
            args
        )
    }

    fn describe_remote_failure(&self, output: &ExecOutput) -> String {
        if output.command_missing() {
            return format!(
                "`{}` not found on the remote host",
                self.config.remote_service_ctl
            );
        }
        #[derive(Deserialize)]
        struct Message {
            error: String,
        }
        let stderr = output.stderr.trim();
        serde_json::from_str::<Message>(stderr)
            .map(|m| m.error)
            .ok()
            .or_else(|| stderr.lines().last().map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("exit status {}", output.exit_code))
    }
}

fn start_args(port: u16) -> String {
    format!("start --port {} --host 127.0.0.1 --no-browser", port)
}
