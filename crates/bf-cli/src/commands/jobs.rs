//! Job client commands

use std::path::{Path, PathBuf};

use bf_core::error::{exit, BfError};
use bf_core::types::JobId;

use crate::client::{FollowEvent, JobClient, JobConfig, LogFollower};
use crate::output::{
    format_artifacts, format_job, format_jobs, print_error, print_info, print_success,
    print_warning,
};

/// Submit a job, optionally following it to the end
pub async fn submit_command(
    client: &JobClient,
    action: &str,
    config: JobConfig,
    follow: bool,
) -> Result<i32, BfError> {
    let id = client.submit(action, config).await?;
    print_success(&format!("Submitted job {}", id));
    if !follow {
        println!("{}", id);
        return Ok(exit::SUCCESS);
    }
    follow_command(client, &id).await
}

/// Read the configuration of a submission from a local YAML file
pub fn read_config_file(path: &Path) -> Result<JobConfig, BfError> {
    Ok(JobConfig::Inline(std::fs::read_to_string(path)?))
}

/// Stream a job's log to stdout until it finishes
///
/// Exit code 0 when the job completed, 1 otherwise.
pub async fn follow_command(client: &JobClient, id: &JobId) -> Result<i32, BfError> {
    let (follower, mut events) = LogFollower::new(client.clone(), id.clone());
    let task = tokio::spawn(follower.run());

    let mut code = exit::FAILURE;
    while let Some(event) = events.recv().await {
        match &event {
            FollowEvent::Line(line) => println!("{}", line),
            FollowEvent::Finished { status, returncode } => {
                let status = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "finished, final status unknown".to_string());
                let returncode = returncode
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let msg = format!("Job {} {} (return code {})", id, status, returncode);
                if event.is_success() {
                    code = exit::SUCCESS;
                    print_success(&msg);
                } else {
                    print_error(&msg);
                }
            }
            FollowEvent::ArtifactsAvailable(artifacts) => {
                print_info("Artifacts:");
                print!("{}", format_artifacts(artifacts));
            }
            FollowEvent::GaveUp { polls } => {
                print_warning(&format!(
                    "Stopped following after {} polls; the job is still running",
                    polls
                ));
            }
        }
    }

    match task.await {
        Ok(result) => result?,
        Err(e) => return Err(BfError::Io(std::io::Error::other(e))),
    }
    Ok(code)
}

pub async fn status_command(client: &JobClient, id: &JobId) -> Result<i32, BfError> {
    let job = client.job(id).await?;
    print!("{}", format_job(&job));
    Ok(exit::SUCCESS)
}

/// List artifacts, or download one of them
pub async fn artifacts_command(
    client: &JobClient,
    id: &JobId,
    download: Option<usize>,
    output: Option<PathBuf>,
) -> Result<i32, BfError> {
    let Some(index) = download else {
        let artifacts = client.artifacts(id).await?;
        if artifacts.is_empty() {
            print_info("No artifacts");
        } else {
            print!("{}", format_artifacts(&artifacts));
        }
        return Ok(exit::SUCCESS);
    };

    let (filename, content) = client.download(id, index).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(&filename));
    std::fs::write(&path, &content)?;
    print_success(&format!(
        "Saved {} ({} bytes) to {}",
        filename,
        content.len(),
        path.display()
    ));
    Ok(exit::SUCCESS)
}

pub async fn stop_command(client: &JobClient, id: &JobId) -> Result<i32, BfError> {
    let reply = client.stop(id).await?;
    match reply.stop.as_str() {
        "already_finished" => print_info(&format!("Job {} already {}", id, reply.status)),
        "already_requested" => print_info(&format!("Stop of job {} already requested", id)),
        _ => print_success(&format!("Stop requested for job {}", id)),
    }
    Ok(exit::SUCCESS)
}

pub async fn ping_command(client: &JobClient) -> Result<i32, BfError> {
    if client.ping().await? {
        print_success(&format!("Server at {} is up", client.base_url()));
        Ok(exit::SUCCESS)
    } else {
        print_error(&format!("Server at {} answered but is not ready", client.base_url()));
        Ok(exit::FAILURE)
    }
}

pub async fn list_command(client: &JobClient) -> Result<i32, BfError> {
    let list = client.list().await?;
    println!("{}", format_jobs(&list.jobs));
    Ok(exit::SUCCESS)
}
