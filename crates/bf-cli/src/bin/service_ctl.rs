//! service-ctl: control bidsflow server instances on this host
//!
//! Instances are keyed by port, so several users (or one user with several
//! ports) can share a host. Exit codes: 0 success, 1 failure, 2 usage,
//! 3 port in use, 4 already running, 5 server binary not found.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use bf_core::config;
use bidsflow::commands::service;
use bidsflow::supervisor::{Scope, Supervisor};
use bidsflow::{finish, init_logging};

#[derive(Parser)]
#[command(name = "service-ctl")]
#[command(author, version, about = "Start, stop and inspect bidsflow server instances")]
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

#[derive(Subcommand)]
enum Commands {
    /// Start an instance in the background
    Start {
        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Do not open a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Stop the instance on a port
    Stop {
        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Report whether an instance runs on a port
    Status {
        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address to probe (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop, then start again
    Restart {
        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// List your running instances, including ones without a PID file
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Kill instances by port, or all of yours
    #[command(group(ArgGroup::new("scope").required(true)))]
    Cleanup {
        /// Port of the instance to kill
        #[arg(short, long, group = "scope")]
        port: Option<u16>,

        /// Kill every instance you own
        #[arg(long, group = "scope")]
        all: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    finish(run(cli).await)
}

async fn run(cli: Cli) -> Result<i32> {
    let mut file = config::load_config_file(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let host = match &cli.command {
        Commands::Start { host, .. }
        | Commands::Status { host, .. }
        | Commands::Restart { host, .. } => host.clone(),
        _ => None,
    };
    if let Some(host) = host {
        file.service.host = host;
    }
    let default_port = file.service.port;
    let supervisor = Supervisor::new(file.service, cli.config.clone());

    let code = match cli.command {
        Commands::Start {
            port, no_browser, ..
        } => service::start_command(&supervisor, port.unwrap_or(default_port), no_browser).await?,
        Commands::Stop { port } => {
            service::stop_command(&supervisor, port.unwrap_or(default_port)).await?
        }
        Commands::Status { port, json, .. } => {
            service::status_command(&supervisor, port.unwrap_or(default_port), json)?
        }
        Commands::Restart { port, .. } => {
            service::restart_command(&supervisor, port.unwrap_or(default_port)).await?
        }
        Commands::List { json } => service::list_command(&supervisor, json).await?,
        Commands::Cleanup { port, json, .. } => {
            let scope = match port {
                Some(port) => Scope::Port(port),
                None => Scope::All,
            };
            service::cleanup_command(&supervisor, scope, json).await?
        }
    };
    Ok(code)
}
