//! Live log streaming over WebSocket.
//!
//! Frame shapes: `{"type":"build","log":{...}}` for stored pipeline logs,
//! `{"type":"container","log":{...}}` for live container output, and
//! `{"type":"status","status":"..."}` when the deployment's status moves.
//! Stored logs replay first, then new build logs are polled in while any
//! container tail runs alongside. Build-tail and container-tail frames have
//! no ordering guarantee between each other beyond best effort.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::db::{Deployment, DeploymentLog, DeploymentStatus};
use crate::runtime::LogLine;
use crate::AppState;

pub async fn deployment_logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_log_stream(socket, state, deployment_id))
}

fn build_frame(log: &DeploymentLog) -> String {
    serde_json::json!({
        "type": "build",
        "log": {
            "id": log.id,
            "level": log.level,
            "message": log.message,
            "timestamp": log.timestamp,
        }
    })
    .to_string()
}

fn container_frame(line: &LogLine) -> String {
    serde_json::json!({
        "type": "container",
        "log": {
            "message": line.message,
            "timestamp": line.timestamp,
        }
    })
    .to_string()
}

fn status_frame(status: &str) -> String {
    serde_json::json!({ "type": "status", "status": status }).to_string()
}

async fn handle_log_stream(socket: WebSocket, state: Arc<AppState>, deployment_id: String) {
    let (mut sender, mut receiver) = socket.split();

    // Replay everything stored so far
    let mut last_log_id: i64 = 0;
    if let Ok(logs) = sqlx::query_as::<_, DeploymentLog>(
        "SELECT * FROM deployment_logs WHERE deployment_id = ? ORDER BY id ASC",
    )
    .bind(&deployment_id)
    .fetch_all(&state.db)
    .await
    {
        for log in logs {
            last_log_id = log.id;
            if sender.send(Message::Text(build_frame(&log).into())).await.is_err() {
                return;
            }
        }
    }

    let deployment: Option<Deployment> = sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
        .bind(&deployment_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(deployment) = deployment else {
        let _ = sender.send(Message::Text(r#"{"type":"end"}"#.into())).await;
        return;
    };

    let mut last_status = deployment.status.clone();
    if sender
        .send(Message::Text(status_frame(&last_status).into()))
        .await
        .is_err()
    {
        return;
    }

    // Tail the container when one is running
    let mut container_logs: Option<Pin<Box<dyn Stream<Item = LogLine> + Send>>> = None;
    if deployment.status_enum() == DeploymentStatus::Running {
        if let Some(container_id) = &deployment.container_id {
            container_logs = state.runtime.follow_logs(container_id).await.ok();
        }
    }

    let mut poll_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = poll_interval.tick() => {
                // New build logs since the last frame
                if let Ok(new_logs) = sqlx::query_as::<_, DeploymentLog>(
                    "SELECT * FROM deployment_logs WHERE deployment_id = ? AND id > ? ORDER BY id ASC",
                )
                .bind(&deployment_id)
                .bind(last_log_id)
                .fetch_all(&state.db)
                .await
                {
                    for log in new_logs {
                        last_log_id = log.id;
                        if sender.send(Message::Text(build_frame(&log).into())).await.is_err() {
                            return;
                        }
                    }
                }

                // Status transitions
                let status: Option<(String, Option<String>)> = sqlx::query_as(
                    "SELECT status, container_id FROM deployments WHERE id = ?",
                )
                .bind(&deployment_id)
                .fetch_optional(&state.db)
                .await
                .ok()
                .flatten();
                let Some((status, container_id)) = status else {
                    let _ = sender.send(Message::Text(r#"{"type":"end"}"#.into())).await;
                    return;
                };
                if status != last_status {
                    last_status = status.clone();
                    if sender.send(Message::Text(status_frame(&status).into())).await.is_err() {
                        return;
                    }
                    // A deployment that just came up gets its container tailed
                    if status == "running" && container_logs.is_none() {
                        if let Some(container_id) = &container_id {
                            container_logs = state.runtime.follow_logs(container_id).await.ok();
                        }
                    }
                }
            }
            line = async {
                match container_logs.as_mut() {
                    Some(stream) => stream.next().await,
                    None => std::future::pending().await,
                }
            } => {
                match line {
                    Some(line) => {
                        if sender.send(Message::Text(container_frame(&line).into())).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        container_logs = None;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}
