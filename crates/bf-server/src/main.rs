//! bidsflow job server
//!
//! Serves the job API on one port: conversion jobs are submitted over
//! HTTP, their output is streamed over WebSocket with a polling fallback.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bf_core::config;
use bf_core::pidfile::PidFileGuard;
use bf_server::jobs::run_retention;
use bf_server::{api, ServerState};

#[derive(Parser)]
#[command(name = "bidsflow-server")]
#[command(about = "bidsflow job server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory jobs run in and config paths are resolved against
    #[arg(long)]
    root: Option<PathBuf>,

    /// Write our PID to this file while running
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut file = config::load_config_file(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(root) = args.root {
        file.server.root = root;
    }
    let host = args.host.unwrap_or_else(|| file.service.host.clone());
    let port = args.port.unwrap_or(file.service.port);

    let _pid_guard = match args.pid_file {
        Some(path) => Some(
            PidFileGuard::new(path.clone(), std::process::id())
                .with_context(|| format!("Failed to write PID file {:?}", path))?,
        ),
        None => None,
    };

    let retention = file.server.job_retention;
    let retention_interval = file.server.retention_interval;
    let state = ServerState::new(file.server);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    tokio::spawn(run_retention(
        Arc::clone(state.job_manager()),
        retention,
        retention_interval,
        cancel.clone(),
    ));

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    tracing::info!("bidsflow server listening on http://{}:{}", host, port);

    let shutdown = cancel.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("bidsflow server shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
