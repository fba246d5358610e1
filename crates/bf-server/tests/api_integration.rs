//! HTTP and WebSocket API tests

use std::path::PathBuf;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use bf_core::config::ServerConfig;
use bf_server::{api, ServerState};

fn test_router(root: &TempDir, script: &str) -> Router {
    std::fs::write(root.path().join("convert.sh"), script).unwrap();
    api::router(ServerState::new(ServerConfig {
        root: root.path().to_path_buf(),
        converter: PathBuf::from("convert.sh"),
        python: "/bin/sh".to_string(),
        extra_artifacts: vec![],
        ..Default::default()
    }))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_terminal(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (_, job) = send(app, get(&format!("/api/jobs/{}", id))).await;
        if matches!(
            job["status"].as_str(),
            Some("completed" | "failed" | "aborted")
        ) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} did not finish", id);
}

#[tokio::test]
async fn test_ping() {
    let root = TempDir::new().unwrap();
    let app = test_router(&root, "exit 0");
    let (status, body) = send(&app, get("/api/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn test_submit_bogus_action_is_rejected() {
    let root = TempDir::new().unwrap();
    let app = test_router(&root, "exit 0");

    let (status, body) = send(
        &app,
        post_json("/api/jobs", json!({ "action": "bogus", "config_yaml": "a: 1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_action");
    assert!(body["error"].as_str().unwrap().contains("bogus"));

    let (_, list) = send(&app, get("/api/jobs")).await;
    assert_eq!(list["jobs"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_submit_requires_config() {
    let root = TempDir::new().unwrap();
    let app = test_router(&root, "exit 0");

    let (status, _) = send(&app, post_json("/api/jobs", json!({ "action": "run" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({ "action": "run", "config_path": "../../etc/passwd" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_config");
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let root = TempDir::new().unwrap();
    let app = test_router(&root, "exit 0");

    for uri in [
        "/api/jobs/nope",
        "/api/jobs/nope/logs",
        "/api/jobs/nope/artifacts",
        "/api/jobs/nope/artifact?index=0",
    ] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["kind"], "job_not_found");
    }
    let (status, _) = send(&app, post_json("/api/jobs/nope/stop", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[cfg(unix)]
#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let root = TempDir::new().unwrap();
    let app = test_router(
        &root,
        "echo first\necho second\nprintf 'a\\tb\\n' > \"$BIDSFLOW_ARTIFACT_DIR/table.tsv\"\n",
    );

    let (status, body) = send(
        &app,
        post_json("/api/jobs", json!({ "action": "run", "config_yaml": "a: 1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["job_id"].as_str().unwrap().to_string();

    let job = wait_terminal(&app, &id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["returncode"], 0);
    assert_eq!(job["action"], "run");

    let (_, page) = send(&app, get(&format!("/api/jobs/{}/logs", id))).await;
    let logs = page["logs"].as_array().unwrap();
    assert_eq!(page["next_offset"], logs.len());
    assert_eq!(page["status"], "completed");
    assert_eq!(job["logs_count"], logs.len());

    let (_, tail) = send(&app, get(&format!("/api/jobs/{}/logs?since=2", id))).await;
    assert_eq!(tail["logs"].as_array().unwrap().len(), logs.len() - 2);

    let (_, artifacts) = send(&app, get(&format!("/api/jobs/{}/artifacts", id))).await;
    let artifacts = artifacts["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].as_str().unwrap().ends_with("table.tsv"));

    let response = app
        .clone()
        .oneshot(get(&format!("/api/jobs/{}/artifact?index=0", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"table.tsv\""
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"a\tb\n");

    let (status, _) = send(&app, get(&format!("/api/jobs/{}/artifact?index=5", id))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Stop on a finished job acknowledges without changing anything
    let (status, body) = send(&app, post_json(&format!("/api/jobs/{}/stop", id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stop"], "already_finished");
    assert_eq!(body["status"], "completed");

    let (_, list) = send(&app, get("/api/jobs")).await;
    assert_eq!(list["jobs"][0]["id"], id.as_str());
}

#[cfg(unix)]
#[tokio::test]
async fn test_large_artifact_download() {
    let root = TempDir::new().unwrap();
    let app = test_router(
        &root,
        "head -c 1048576 /dev/zero > \"$BIDSFLOW_ARTIFACT_DIR/raw.fif\"\n",
    );

    let (_, body) = send(
        &app,
        post_json("/api/jobs", json!({ "action": "run", "config_yaml": "a: 1" })),
    )
    .await;
    let id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(wait_terminal(&app, &id).await["status"], "completed");

    let response = app
        .clone()
        .oneshot(get(&format!("/api/jobs/{}/artifact?index=0", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1048576");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 1048576);
    assert!(bytes.iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_client_log_is_accepted() {
    let root = TempDir::new().unwrap();
    let app = test_router(&root, "exit 0");
    let (status, body) = send(
        &app,
        post_json("/api/client-log", json!({ "message": "boom", "source": "editor" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[cfg(unix)]
mod websocket {
    use super::*;
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn collect_frames(url: &str) -> Vec<String> {
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let mut frames = Vec::new();
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Text(text)) => frames.push(text),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_push_stream_ends_with_sentinel() {
        let root = TempDir::new().unwrap();
        let app = test_router(&root, "echo one\nsleep 0.3\necho two\nexit 4\n");
        let port = serve(app.clone()).await;

        let (_, body) = send(
            &app,
            post_json("/api/jobs", json!({ "action": "analyse", "config_yaml": "a: 1" })),
        )
        .await;
        let id = body["job_id"].as_str().unwrap().to_string();

        let frames =
            collect_frames(&format!("ws://127.0.0.1:{}/ws/jobs/{}/logs", port, id)).await;
        let transcript = frames.concat();
        assert!(transcript.contains("one\n"));
        assert!(transcript.contains("two\n"));
        assert!(transcript.find("one\n") < transcript.find("two\n"));
        assert_eq!(frames.last().unwrap(), "__JOB_DONE__ returncode=4\n");

        // The push stream carried exactly what the pull side has buffered
        let (_, page) = send(&app, get(&format!("/api/jobs/{}/logs", id))).await;
        let pulled: String = page["logs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| format!("{}\n", e["line"].as_str().unwrap()))
            .collect();
        assert_eq!(transcript, pulled);
    }

    #[tokio::test]
    async fn test_push_stream_unknown_job() {
        let root = TempDir::new().unwrap();
        let port = serve(test_router(&root, "exit 0")).await;
        let frames = collect_frames(&format!("ws://127.0.0.1:{}/ws/jobs/nope/logs", port)).await;
        assert_eq!(frames, vec![api::NOT_FOUND_FRAME.to_string()]);
    }
}
