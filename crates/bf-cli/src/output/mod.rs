//! Output formatting utilities for the CLI
//!
//! Tables for service instances and jobs, job and tunnel status displays,
//! and colored status messages.

use tabled::{settings::Style, Table, Tabled};

use bf_core::time::{elapsed_since, format_duration};
use bf_core::types::{InstanceSource, ServiceInstance};
use bf_server::jobs::{JobSnapshot, JobSummary};
use bf_tunnel::{ChannelState, TunnelStatus};

/// Format service instances as a table
///
/// Returns "No running instances" for an empty list.
pub fn format_instances(instances: &[ServiceInstance]) -> String {
    if instances.is_empty() {
        return "No running instances".to_string();
    }

    #[derive(Tabled)]
    struct InstanceRow {
        #[tabled(rename = "PORT")]
        port: u16,
        #[tabled(rename = "PID")]
        pid: u32,
        #[tabled(rename = "SOURCE")]
        source: &'static str,
    }

    let rows: Vec<InstanceRow> = instances
        .iter()
        .map(|i| InstanceRow {
            port: i.port,
            pid: i.pid,
            source: match i.source {
                InstanceSource::Pidfile => "pidfile",
                InstanceSource::Orphan => "orphan (no pidfile)",
            },
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format the server's job list as a table
pub fn format_jobs(jobs: &[JobSummary]) -> String {
    if jobs.is_empty() {
        return "No jobs".to_string();
    }

    #[derive(Tabled)]
    struct JobRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "ACTION")]
        action: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "AGE")]
        age: String,
    }

    let rows: Vec<JobRow> = jobs
        .iter()
        .map(|j| JobRow {
            id: truncate(j.id.as_str(), 12),
            action: j.action.to_string(),
            status: j.status.to_string(),
            age: format_duration(elapsed_since(j.created_at)),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format a job snapshot as a human-readable block
pub fn format_job(job: &JobSnapshot) -> String {
    let mut output = String::new();

    output.push_str(&format!("Job: {}\n", job.id));
    output.push_str(&format!("Action: {}\n", job.action));
    output.push_str(&format!("Status: {}\n", job.status));
    if let Some(code) = job.returncode {
        output.push_str(&format!("Return code: {}\n", code));
    }
    if let Some(pid) = job.pid {
        output.push_str(&format!("PID: {}\n", pid));
    }
    output.push_str(&format!("Log lines: {}\n", job.logs_count));
    output.push_str(&format!(
        "Age: {}\n",
        format_duration(elapsed_since(job.created_at))
    ));
    if !job.artifacts.is_empty() {
        output.push_str("Artifacts:\n");
        output.push_str(&format_artifacts(&job.artifacts));
    }

    output
}

/// Numbered artifact list; the number is the download index
pub fn format_artifacts(artifacts: &[String]) -> String {
    artifacts
        .iter()
        .enumerate()
        .map(|(i, path)| format!("  [{}] {}\n", i, path))
        .collect()
}

/// Format the local view of a tunnel session
pub fn format_tunnel_status(status: &TunnelStatus) -> String {
    let mut output = String::new();
    let session = &status.session;

    output.push_str(&format!("Target: {}\n", session.target));
    output.push_str(&format!("Remote path: {}\n", session.remote_path));
    output.push_str(&format!(
        "Remote port: {}\n",
        session
            .remote_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string())
    ));

    let channel = match &status.channel {
        ChannelState::Alive { pid, local_port } => format!(
            "active (PID {}) -> http://127.0.0.1:{}",
            pid, local_port
        ),
        ChannelState::Dead { pid, local_port } => {
            format!("dead (PID {} no longer running, port {})", pid, local_port)
        }
        ChannelState::Unverified { local_port } => {
            format!("unverified (PID unknown, port {})", local_port)
        }
        ChannelState::None => "none".to_string(),
    };
    output.push_str(&format!("Channel: {}\n", channel));

    if let Some(running) = status.remote_running {
        output.push_str(&format!(
            "Remote service: {}\n",
            if running { "running" } else { "not running" }
        ));
    }

    output
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
