//! Tunnel commands

use bf_core::config::TunnelConfig;
use bf_core::error::{exit, BfError};
use bf_core::pidfile::Termination;
use bf_core::ports::local_probes;
use bf_core::RemoteExec;
use bf_tunnel::{
    AuthMode, ChannelState, CleanupScope, Orchestrator, SessionStore, SshForwarder, SshSession,
    StartRequest, TerminalInteraction,
};

use crate::output::{
    format_instances, format_tunnel_status, print_info, print_success, print_warning,
};

type SshOrchestrator = Orchestrator<SshForwarder>;

/// Explicit connection details of one invocation
#[derive(Debug, Clone, Default)]
pub struct TargetArgs {
    pub target: Option<String>,
    pub remote_path: Option<String>,
}

/// Options of `tunnel-ctl start`
#[derive(Debug, Clone, Default)]
pub struct StartArgs {
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub auto_port: bool,
    pub autossh: bool,
}

fn build(config: &TunnelConfig, ssh: SshSession) -> SshOrchestrator {
    let store = SessionStore::new(&config.state_dir);
    let forwarder = SshForwarder::new(ssh, store.forward_log_path());
    Orchestrator::new(
        config.clone(),
        store,
        forwarder,
        Box::new(TerminalInteraction),
        local_probes("127.0.0.1"),
    )
}

/// Orchestrator for commands that never open a channel
fn local(config: &TunnelConfig) -> Result<SshOrchestrator, BfError> {
    let target = SessionStore::new(&config.state_dir)
        .load()?
        .map(|s| s.target)
        .unwrap_or_default();
    Ok(build(
        config,
        SshSession::new(target, config.connect_timeout, AuthMode::Key),
    ))
}

/// Resolve the target and authenticate once for the whole invocation
async fn connect(
    config: &TunnelConfig,
    args: TargetArgs,
) -> Result<(SshSession, String), BfError> {
    let store = SessionStore::new(&config.state_dir);
    let (target, remote_path) = store.resolve_target(args.target, args.remote_path)?;
    let ssh = SshSession::connect(&target, config.connect_timeout, &TerminalInteraction).await?;
    Ok((ssh, remote_path))
}

/// Start the remote service and forward a local port to it
pub async fn start_command(
    config: &TunnelConfig,
    target: TargetArgs,
    args: StartArgs,
) -> Result<i32, BfError> {
    let (ssh, remote_path) = connect(config, target).await?;
    let mut orchestrator = build(config, ssh.clone());

    print_info(&format!("Starting bidsflow on {}:{}", ssh.target(), remote_path));
    let outcome = orchestrator
        .start(
            &ssh,
            StartRequest {
                target: ssh.target().to_string(),
                remote_path,
                remote_port: args.remote_port,
                local_port: args.local_port,
                auto_port: args.auto_port,
                autossh: args.autossh,
            },
        )
        .await?;

    print_success(&format!(
        "Tunnel active: {} -> {}:{}",
        outcome.url(),
        outcome.target,
        outcome.remote_port
    ));
    match outcome.channel_pid {
        Some(pid) => print_info(&format!("Forwarding process PID {}", pid)),
        None => print_warning(
            "The forwarding process could not be identified; `tunnel-ctl stop` cannot close it",
        ),
    }
    Ok(exit::SUCCESS)
}

/// Close the channel; with `remote`, also stop the remote service
pub async fn stop_command(
    config: &TunnelConfig,
    target: TargetArgs,
    remote: bool,
    yes: bool,
) -> Result<i32, BfError> {
    let mut orchestrator = local(config)?;
    let session = orchestrator.store().load()?;

    match orchestrator.stop_channel().await? {
        Some(Termination::NotRunning) => print_info("Forwarding process was already gone"),
        Some(Termination::Survived) => print_warning("Forwarding process did not exit"),
        Some(_) => print_success("Tunnel closed"),
        None if session.as_ref().and_then(|s| s.channel).is_some() => {
            print_warning("No forwarding PID was recorded; the channel may still be running")
        }
        None => print_info("No tunnel to close"),
    }

    if !remote {
        return Ok(exit::SUCCESS);
    }

    let remote_port = session.as_ref().and_then(|s| s.remote_port);
    let Some(port) = remote_port else {
        print_info("No remote port recorded; nothing to stop remotely");
        return Ok(exit::SUCCESS);
    };
    if !yes && !orchestrator.confirm_remote_stop(port) {
        print_info("Remote service left running");
        return Ok(exit::SUCCESS);
    }

    let (ssh, remote_path) = connect(config, target).await?;
    orchestrator.stop_remote(&ssh, &remote_path, port).await?;
    print_success(&format!("Remote service on port {} stopped", port));
    Ok(exit::SUCCESS)
}

/// Show the recorded session
///
/// Exit code 10 when a channel is recorded without a usable PID.
pub async fn status_command(
    config: &TunnelConfig,
    target: TargetArgs,
    remote: bool,
) -> Result<i32, BfError> {
    let orchestrator = local(config)?;
    let status = if remote {
        let (ssh, _) = connect(config, target).await?;
        orchestrator.status(Some(&ssh as &dyn RemoteExec)).await?
    } else {
        orchestrator.status(None).await?
    };

    print!("{}", format_tunnel_status(&status));
    Ok(match status.channel {
        ChannelState::Unverified { .. } => exit::TUNNEL_UNVERIFIED,
        ChannelState::Dead { .. } | ChannelState::None => exit::FAILURE,
        ChannelState::Alive { .. } => exit::SUCCESS,
    })
}

/// Service instances of the remote user
pub async fn list_command(config: &TunnelConfig, target: TargetArgs) -> Result<i32, BfError> {
    let (ssh, remote_path) = connect(config, target).await?;
    let orchestrator = build(config, ssh.clone());
    let instances = orchestrator.list(&ssh, &remote_path).await?;

    println!("Service instances on {}:", ssh.target());
    println!("{}", format_instances(&instances));
    Ok(exit::SUCCESS)
}

/// Kill remote instances by port, or all of them
pub async fn cleanup_command(
    config: &TunnelConfig,
    target: TargetArgs,
    scope: CleanupScope,
) -> Result<i32, BfError> {
    let (ssh, remote_path) = connect(config, target).await?;
    let orchestrator = build(config, ssh.clone());
    let stopped = orchestrator.cleanup(&ssh, &remote_path, scope).await?;

    if stopped.is_empty() {
        print_info("No remote instances matched");
    }
    for instance in &stopped {
        print_success(&format!(
            "Stopped remote instance on port {} (PID {})",
            instance.port, instance.pid
        ));
    }
    Ok(exit::SUCCESS)
}
