//! bidsflow job client
//!
//! Submits conversion jobs to a bidsflow server and follows their output:
//! live over WebSocket, falling back to polling when the push stream drops.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use bf_core::types::JobId;
use bidsflow::client::{JobClient, JobConfig, DEFAULT_URL};
use bidsflow::commands::jobs;
use bidsflow::{finish, init_logging};

#[derive(Parser)]
#[command(name = "bidsflow")]
#[command(author, version, about = "Run and follow bidsflow conversion jobs")]
#[command(propagate_version = true)]
struct Cli {
    /// Server URL (through a tunnel this is the local forwarded port)
    #[arg(long, global = true, env = "BIDSFLOW_URL", default_value = DEFAULT_URL)]
    url: String,

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
    /// Submit a conversion job
    #[command(group(ArgGroup::new("config").required(true)))]
    Submit {
        /// analyse, run or report
        #[arg(short, long)]
        action: String,

        /// Configuration file on the server host
        #[arg(long, group = "config")]
        config_path: Option<String>,

        /// Local YAML configuration sent with the request
        #[arg(long, group = "config")]
        config_file: Option<PathBuf>,

        /// Stream the job's log until it finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Stream a job's log until it finishes
    Follow {
        /// Job ID
        id: String,
    },

    /// Show a job's status
    Status {
        /// Job ID
        id: String,
    },

    /// List or download a job's artifacts
    Artifacts {
        /// Job ID
        id: String,

        /// Download the artifact with this index
        #[arg(short, long)]
        download: Option<usize>,

        /// Where to save the download (default: the artifact's file name)
        #[arg(short, long, requires = "download")]
        output: Option<PathBuf>,
    },

    /// Request termination of a job
    Stop {
        /// Job ID
        id: String,
    },

    /// Check that the server answers
    Ping,

    /// List the server's jobs
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    finish(run(cli).await)
}

async fn run(cli: Cli) -> Result<i32> {
    let client = JobClient::new(&cli.url)?;

    let code = match cli.command {
        Commands::Submit {
            action,
            config_path,
            config_file,
            follow,
        } => {
            let config = match (config_path, config_file) {
                (Some(path), _) => JobConfig::ServerPath(path),
                (None, Some(file)) => jobs::read_config_file(&file)
                    .with_context(|| format!("Failed to read {:?}", file))?,
                (None, None) => anyhow::bail!("Pass --config-path or --config-file"),
            };
            jobs::submit_command(&client, &action, config, follow).await?
        }
        Commands::Follow { id } => jobs::follow_command(&client, &JobId::new(id)).await?,
        Commands::Status { id } => jobs::status_command(&client, &JobId::new(id)).await?,
        Commands::Artifacts {
            id,
            download,
            output,
        } => jobs::artifacts_command(&client, &JobId::new(id), download, output).await?,
        Commands::Stop { id } => jobs::stop_command(&client, &JobId::new(id)).await?,
        Commands::Ping => jobs::ping_command(&client).await?,
        Commands::List => jobs::list_command(&client).await?,
    };
    Ok(code)
}
