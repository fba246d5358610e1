//! tunnel-ctl: reach a remote bidsflow server through an SSH tunnel
//!
//! `start` runs `service-ctl start` on the remote host, waits for it to
//! answer, then forwards a free local port to it. The session is recorded
//! in the state directory so later commands need no arguments.
//!
//! Exit codes: 0 success, 1 failure, 2 usage, 3 remote port in use,
//! 6 authentication failed, 7 health check timed out, 8 tool missing,
//! 9 local port conflict, 10 tunnel PID unverifiable, 11 remote start
//! failed, 12 connection error, 13 no session recorded, 16 no free port.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};

use bf_core::config;
use bf_tunnel::CleanupScope;
use bidsflow::commands::tunnel::{self, StartArgs, TargetArgs};
use bidsflow::{finish, init_logging};

#[derive(Parser)]
#[command(name = "tunnel-ctl")]
#[command(author, version, about = "SSH tunnel to a remote bidsflow server")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// SSH target, e.g. user@host (default: the recorded session)
    target: Option<String>,

    /// bidsflow checkout on the remote host (default: the recorded one)
    remote_path: Option<String>,
}

impl From<Target> for TargetArgs {
    fn from(t: Target) -> Self {
        TargetArgs {
            target: t.target,
            remote_path: t.remote_path,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the remote server and open the tunnel
    Start {
        #[command(flatten)]
        target: Target,

        /// First local port to try
        #[arg(short, long)]
        local_port: Option<u16>,

        /// Remote port (default: reuse the recorded one or pick a free one)
        #[arg(short, long)]
        remote_port: Option<u16>,

        /// Pick the next free port instead of failing or asking
        #[arg(long)]
        auto_port: bool,

        /// Use autossh for a self-reconnecting channel
        #[arg(long)]
        autossh: bool,
    },

    /// Close the tunnel
    Stop {
        #[command(flatten)]
        target: Target,

        /// Also stop the remote server
        #[arg(long)]
        remote: bool,

        /// Do not ask before stopping the remote server
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the recorded session
    Status {
        #[command(flatten)]
        target: Target,

        /// Also ask the remote host whether the server runs
        #[arg(long)]
        remote: bool,
    },

    /// List your server instances on the remote host
    List {
        #[command(flatten)]
        target: Target,
    },

    /// Kill remote instances by port, or all of yours
    #[command(group(ArgGroup::new("scope").required(true)))]
    Cleanup {
        #[command(flatten)]
        target: Target,

        /// Port of the remote instance to kill
        #[arg(short, long, group = "scope")]
        port: Option<u16>,

        /// Kill every remote instance you own
        #[arg(long, group = "scope")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    finish(run(cli).await)
}

async fn run(cli: Cli) -> Result<i32> {
    let file = config::load_config_file(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let config = file.tunnel;

    let code = match cli.command {
        Commands::Start {
            target,
            local_port,
            remote_port,
            auto_port,
            autossh,
        } => {
            let args = StartArgs {
                local_port,
                remote_port,
                auto_port,
                autossh,
            };
            tunnel::start_command(&config, target.into(), args).await?
        }
        Commands::Stop {
            target,
            remote,
            yes,
        } => tunnel::stop_command(&config, target.into(), remote, yes).await?,
        Commands::Status { target, remote } => {
            tunnel::status_command(&config, target.into(), remote).await?
        }
        Commands::List { target } => tunnel::list_command(&config, target.into()).await?,
        Commands::Cleanup { target, port, .. } => {
            let scope = match port {
                Some(port) => CleanupScope::Port(port),
                None => CleanupScope::All,
            };
            tunnel::cleanup_command(&config, target.into(), scope).await?
        }
    };
    Ok(code)
}
