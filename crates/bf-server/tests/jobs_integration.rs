//! Job manager tests against real subprocesses
//!
//! The converter is replaced by small shell scripts run through `/bin/sh`
//! as the interpreter, so no freshly written file is ever exec'd directly.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use bf_core::config::ServerConfig;
use bf_core::types::{JobId, JobStatus, LogStream};
use bf_server::jobs::{ConfigRef, JobManager, JobSnapshot, StopOutcome};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{}\n", body)).unwrap();
    path
}

fn manager_with_script(root: &TempDir, body: &str) -> JobManager {
    write_script(root.path(), "convert.sh", body);
    JobManager::new(ServerConfig {
        root: root.path().to_path_buf(),
        converter: PathBuf::from("convert.sh"),
        python: "/bin/sh".to_string(),
        extra_artifacts: vec![],
        stop_grace: Duration::from_millis(500),
        ..Default::default()
    })
}

async fn wait_terminal(manager: &JobManager, id: &JobId) -> JobSnapshot {
    for _ in 0..200 {
        let snapshot = manager.snapshot(id).unwrap();
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} did not finish", id);
}

async fn wait_for_line(manager: &JobManager, id: &JobId, needle: &str) {
    for _ in 0..200 {
        let page = manager.poll(id, 0).unwrap();
        if page.logs.iter().any(|e| e.line.contains(needle)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("line {:?} never appeared", needle);
}

#[tokio::test]
async fn test_run_job_completes_with_artifact() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(
        &root,
        r#"echo "converting with $2 $3"
echo "wrote 1 file"
echo "participant_id" > "$BIDSFLOW_ARTIFACT_DIR/bids_conversion.tsv"
exit 0"#,
    );

    let id = manager
        .submit("run", ConfigRef::Inline("dataset: demo\n".into()))
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &id).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.returncode, Some(0));
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.artifacts.len(), 1);
    assert!(snapshot.artifacts[0].ends_with("bids_conversion.tsv"));

    let page = manager.poll(&id, 0).unwrap();
    let stdout: Vec<&str> = page
        .logs
        .iter()
        .filter(|e| e.stream == LogStream::Stdout)
        .map(|e| e.line.as_str())
        .collect();
    assert_eq!(stdout.len(), 2);
    assert!(stdout[0].starts_with("converting with "));
    assert!(stdout[0].ends_with("used_config.yml --run"));
    assert_eq!(stdout[1], "wrote 1 file");

    assert!(page.logs[0].line.starts_with("[CMD] "));
    assert_eq!(
        page.logs.last().unwrap().line,
        "__JOB_DONE__ returncode=0"
    );
}

#[tokio::test]
async fn test_config_snapshot_is_kept() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("project.yml"), "dataset: from-file\n").unwrap();
    let manager = manager_with_script(&root, "cat \"$2\"");

    let id = manager
        .submit("analyse", ConfigRef::Path(PathBuf::from("project.yml")))
        .await
        .unwrap();
    wait_terminal(&manager, &id).await;

    let snapshot = root
        .path()
        .join("logs")
        .join("jobs")
        .join(id.as_str())
        .join("used_config.yml");
    assert_eq!(
        std::fs::read_to_string(snapshot).unwrap(),
        "dataset: from-file\n"
    );
    let page = manager.poll(&id, 0).unwrap();
    assert!(page.logs.iter().any(|e| e.line == "dataset: from-file"));
}

#[tokio::test]
async fn test_nonzero_exit_is_failed() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(&root, "echo 'bad subject' >&2\nexit 3");

    let id = manager
        .submit("report", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.returncode, Some(3));
    assert!(snapshot.artifacts.is_empty());

    let page = manager.poll(&id, 0).unwrap();
    assert!(page
        .logs
        .iter()
        .any(|e| e.stream == LogStream::Stderr && e.line == "bad subject"));
    assert_eq!(page.logs.last().unwrap().line, "__JOB_DONE__ returncode=3");
}

#[tokio::test]
async fn test_missing_interpreter_fails_immediately() {
    let root = TempDir::new().unwrap();
    let manager = JobManager::new(ServerConfig {
        root: root.path().to_path_buf(),
        python: "/nonexistent/python3".to_string(),
        extra_artifacts: vec![],
        ..Default::default()
    });

    let id = manager
        .submit("run", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.returncode, Some(127));
    let page = manager.poll(&id, 0).unwrap();
    assert!(page
        .logs
        .iter()
        .any(|e| e.stream == LogStream::Stderr && e.line.contains("Failed to spawn")));
}

#[tokio::test]
async fn test_silent_job_notes_missing_output() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(&root, "exit 0");

    let id = manager
        .submit("run", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();
    wait_terminal(&manager, &id).await;

    let page = manager.poll(&id, 0).unwrap();
    assert!(page.logs.iter().any(|e| e.line.starts_with("[INFO] no stdout")));
}

#[tokio::test]
async fn test_stop_aborts_running_job() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(&root, "echo started\nexec sleep 30");

    let id = manager
        .submit("run", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();
    wait_for_line(&manager, &id, "started").await;
    assert_eq!(manager.snapshot(&id).unwrap().status, JobStatus::Running);

    assert_eq!(manager.stop(&id).unwrap(), StopOutcome::Requested);
    let snapshot = wait_terminal(&manager, &id).await;
    assert_eq!(snapshot.status, JobStatus::Aborted);
    assert_eq!(snapshot.returncode, None);

    // Stopping a finished job is a harmless no-op, twice
    assert_eq!(manager.stop(&id).unwrap(), StopOutcome::AlreadyFinished);
    assert_eq!(manager.stop(&id).unwrap(), StopOutcome::AlreadyFinished);

    let page = manager.poll(&id, 0).unwrap();
    assert!(page.logs.iter().any(|e| e.line.starts_with("[STOP]")));
    assert!(page.logs.last().unwrap().line.starts_with("__JOB_DONE__"));
}

#[tokio::test]
async fn test_stop_escalates_when_term_is_ignored() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(
        &root,
        "trap '' TERM\necho ready\nwhile true; do sleep 0.1; done",
    );

    let id = manager
        .submit("run", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();
    wait_for_line(&manager, &id, "ready").await;

    manager.stop(&id).unwrap();
    let snapshot = wait_terminal(&manager, &id).await;
    assert_eq!(snapshot.status, JobStatus::Aborted);
}

#[tokio::test]
async fn test_status_never_regresses() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(&root, "echo one\nsleep 0.2\necho two");

    let id = manager
        .submit("run", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();

    let rank = |s: JobStatus| match s {
        JobStatus::Queued => 0,
        JobStatus::Running => 1,
        _ => 2,
    };
    let mut last = 0;
    for _ in 0..200 {
        let snapshot = manager.snapshot(&id).unwrap();
        let current = rank(snapshot.status);
        assert!(current >= last, "status went backwards");
        assert_eq!(
            snapshot.returncode.is_some(),
            snapshot.status.has_returncode()
        );
        last = current;
        if snapshot.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last, 2);
}

#[tokio::test]
async fn test_pull_replay_never_loses_lines() {
    let root = TempDir::new().unwrap();
    let manager = manager_with_script(&root, "for i in 1 2 3 4 5 6 7 8; do echo line$i; sleep 0.02; done");

    let id = manager
        .submit("run", ConfigRef::Inline("a: 1".into()))
        .await
        .unwrap();

    let mut offset = 0;
    let mut seen = Vec::new();
    loop {
        let page = manager.poll(&id, offset).unwrap();
        offset = page.next_offset;
        seen.extend(page.logs.into_iter().map(|e| e.line));
        if page.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let full: Vec<String> = manager
        .poll(&id, 0)
        .unwrap()
        .logs
        .into_iter()
        .map(|e| e.line)
        .collect();
    assert_eq!(seen, full);
    let lines: Vec<&String> = seen.iter().filter(|l| l.starts_with("line")).collect();
    assert_eq!(lines.len(), 8);
}

#[tokio::test]
async fn test_unknown_job() {
    let manager = JobManager::new(ServerConfig::default());
    let id = JobId::new("nope");
    assert!(manager.snapshot(&id).is_err());
    assert!(manager.stop(&id).is_err());
    assert!(manager.attach(&id).is_err());
}
