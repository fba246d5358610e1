//! Push side of the log channel over WebSocket
//!
//! Each frame is raw log text (one line plus newline). The backlog is
//! replayed first, then live lines follow until the terminal sentinel,
//! after which the server closes the socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;

use bf_core::types::{JobId, LogEntry};

use crate::jobs::LogSubscription;
use crate::state::ServerState;

/// Frame sent when the requested job does not exist
pub const NOT_FOUND_FRAME: &str = "ERROR: job not found";

pub async fn job_logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Response {
    let subscription = state.jobs.attach(&JobId::new(id.clone())).ok();
    ws.on_upgrade(move |socket| async move {
        match subscription {
            Some(subscription) => stream_logs(socket, subscription, &id).await,
            None => reject(socket).await,
        }
    })
}

async fn reject(mut socket: WebSocket) {
    let _ = socket.send(Message::Text(NOT_FOUND_FRAME.to_string())).await;
    let _ = socket.send(Message::Close(None)).await;
}

fn frame(entry: &LogEntry) -> Message {
    Message::Text(format!("{}\n", entry.line))
}

async fn stream_logs(mut socket: WebSocket, mut subscription: LogSubscription, id: &str) {
    tracing::debug!("Log consumer attached to job {}", id);

    for entry in std::mem::take(&mut subscription.backlog) {
        if socket.send(frame(&entry)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            next = subscription.receiver.recv() => {
                match next {
                    Some(entry) => {
                        if socket.send(frame(&entry)).await.is_err() {
                            break;
                        }
                    }
                    // Job reached its terminal state and the sentinel was sent
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::debug!("Log consumer detached from job {}", id);
}
