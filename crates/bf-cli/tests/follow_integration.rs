//! Job client tests against an in-process server
//!
//! The converter is a small shell script run through `/bin/sh`.
#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use bf_core::config::ServerConfig;
use bf_core::error::{BfError, JobError};
use bf_core::types::{JobId, JobStatus};
use bf_server::{api, ServerState};
use bidsflow::client::{FollowEvent, JobClient, JobConfig, LogFollower};

async fn serve(root: &TempDir, script: &str) -> JobClient {
    std::fs::write(root.path().join("convert.sh"), script).unwrap();
    let state = ServerState::new(ServerConfig {
        root: root.path().to_path_buf(),
        converter: PathBuf::from("convert.sh"),
        python: "/bin/sh".to_string(),
        extra_artifacts: vec![],
        ..Default::default()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });
    JobClient::new(&format!("http://{}", addr)).unwrap()
}

async fn collect(client: &JobClient, id: &JobId) -> Vec<FollowEvent> {
    let (follower, mut rx) = LogFollower::new(client.clone(), id.clone());
    let follower = follower.with_polling(Duration::from_millis(50), 200);
    let task = tokio::spawn(follower.run());

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    task.await.unwrap().unwrap();
    events
}

fn lines(events: &[FollowEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            FollowEvent::Line(l) => Some(l.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_ping() {
    let root = TempDir::new().unwrap();
    let client = serve(&root, "exit 0").await;
    assert!(client.ping().await.unwrap());
}

#[tokio::test]
async fn test_follow_job_to_completion() {
    let root = TempDir::new().unwrap();
    let client = serve(
        &root,
        "echo first\necho second\necho report > \"$BIDSFLOW_ARTIFACT_DIR/report.txt\"\nexit 0\n",
    )
    .await;

    let id = client
        .submit("run", JobConfig::Inline("dataset: test\n".into()))
        .await
        .unwrap();
    let events = collect(&client, &id).await;

    let lines = lines(&events);
    assert!(lines.contains(&"first".to_string()));
    assert!(lines.contains(&"second".to_string()));
    assert!(lines.iter().all(|l| !l.contains("__JOB_DONE__")));

    let finished = events
        .iter()
        .find(|e| matches!(e, FollowEvent::Finished { .. }))
        .expect("no Finished event");
    assert!(finished.is_success());

    let artifacts = events
        .iter()
        .find_map(|e| match e {
            FollowEvent::ArtifactsAvailable(a) => Some(a.clone()),
            _ => None,
        })
        .expect("no artifacts published");
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].ends_with("report.txt"));

    let (name, content) = client.download(&id, 0).await.unwrap();
    assert_eq!(name, "report.txt");
    assert_eq!(content, b"report\n");

    let job = client.job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.returncode, Some(0));
}

#[tokio::test]
async fn test_follow_failed_job() {
    let root = TempDir::new().unwrap();
    let client = serve(&root, "echo oops >&2\nexit 3\n").await;

    let id = client
        .submit("analyse", JobConfig::Inline("a: 1\n".into()))
        .await
        .unwrap();
    let events = collect(&client, &id).await;

    assert!(lines(&events).contains(&"oops".to_string()));
    let finished = events
        .iter()
        .find(|e| matches!(e, FollowEvent::Finished { .. }))
        .unwrap();
    assert!(!finished.is_success());
}

#[tokio::test]
async fn test_unknown_job() {
    let root = TempDir::new().unwrap();
    let client = serve(&root, "exit 0").await;
    let id = JobId::new("does-not-exist");

    let err = client.job(&id).await.unwrap_err();
    assert!(matches!(err, BfError::Job(JobError::NotFound(_))));

    let (follower, _rx) = LogFollower::new(client.clone(), id);
    let err = follower.run().await.unwrap_err();
    assert!(matches!(err, BfError::Job(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_stop_running_job() {
    let root = TempDir::new().unwrap();
    let client = serve(&root, "echo started\nsleep 30\n").await;

    let id = client
        .submit("run", JobConfig::Inline("a: 1\n".into()))
        .await
        .unwrap();
    for _ in 0..100 {
        if client.job(&id).await.unwrap().status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let reply = client.stop(&id).await.unwrap();
    assert_eq!(reply.stop, "requested");

    let events = collect(&client, &id).await;
    let finished = events
        .iter()
        .find(|e| matches!(e, FollowEvent::Finished { .. }))
        .unwrap();
    assert!(!finished.is_success());

    let job = client.job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Aborted);
    assert_eq!(job.returncode, None);
}

#[tokio::test]
async fn test_stopped_job_exiting_cleanly_is_not_success() {
    let root = TempDir::new().unwrap();
    let client = serve(
        &root,
        "trap 'exit 0' TERM\necho started\nwhile true; do sleep 0.05; done\n",
    )
    .await;

    let id = client
        .submit("run", JobConfig::Inline("a: 1\n".into()))
        .await
        .unwrap();
    for _ in 0..100 {
        let job = client.job(&id).await.unwrap();
        if job.status == JobStatus::Running && job.logs_count > 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    client.stop(&id).await.unwrap();

    let events = collect(&client, &id).await;
    let finished = events
        .iter()
        .find(|e| matches!(e, FollowEvent::Finished { .. }))
        .unwrap();
    assert_eq!(
        finished,
        &FollowEvent::Finished {
            status: Some(JobStatus::Aborted),
            returncode: None
        }
    );
    assert!(!finished.is_success());
}

#[tokio::test]
async fn test_list_jobs() {
    let root = TempDir::new().unwrap();
    let client = serve(&root, "exit 0").await;
    let id = client
        .submit("report", JobConfig::Inline("a: 1\n".into()))
        .await
        .unwrap();

    let list = client.list().await.unwrap();
    assert!(list.jobs.iter().any(|j| j.id == id));
}
