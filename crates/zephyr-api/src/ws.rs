//! WebSocket log feed.
//!
//! Clients subscribe per job id and receive `job_update` messages carrying
//! status changes and log chunks. On subscribe the durable tail is replayed
//! from the store; the live feed rides the in-process bus afterwards.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use zephyr_scheduler::BusEvent;

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Unsubscribe {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    JobUpdate {
        #[serde(rename = "jobId")]
        job_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        logs: Option<Vec<LogEntry>>,
    },
}

#[derive(Debug, Serialize)]
struct LogEntry {
    seq: i64,
    stream: String,
    content: String,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    // Job id to last-known status, so log chunks carry a status too.
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut bus_rx = state.bus.subscribe();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(command) = serde_json::from_str::<WsCommand>(&text) {
                            match command {
                                WsCommand::Subscribe { job_id } => {
                                    if subscribe(&state, &mut sender, &mut subscriptions, job_id)
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                WsCommand::Unsubscribe { job_id } => {
                                    subscriptions.remove(&job_id);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }

            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        if forward(&mut sender, &mut subscriptions, event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // The durable tail covers whatever we dropped here.
                        warn!("WebSocket client lagging, skipping messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn subscribe(
    state: &AppState,
    sender: &mut (impl SinkExt<Message> + Unpin),
    subscriptions: &mut HashMap<String, String>,
    job_id: String,
) -> Result<(), ()> {
    info!(job_id = %job_id, "client subscribed");

    let status = match state.store.get_job(&job_id).await {
        Ok(job) => job.status,
        Err(_) => "pending".to_string(),
    };
    let tail = state
        .store
        .logs_for_job(&job_id, None)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|chunk| LogEntry {
            seq: chunk.seq,
            stream: chunk.stream,
            content: String::from_utf8_lossy(&chunk.content).to_string(),
        })
        .collect();

    subscriptions.insert(job_id.clone(), status.clone());
    send(
        sender,
        &WsMessage::JobUpdate {
            job_id,
            status,
            logs: Some(tail),
        },
    )
    .await
}

async fn forward(
    sender: &mut (impl SinkExt<Message> + Unpin),
    subscriptions: &mut HashMap<String, String>,
    event: BusEvent,
) -> Result<(), ()> {
    match event {
        BusEvent::JobUpdate { job_id, status, .. } => {
            if subscriptions.contains_key(&job_id) {
                subscriptions.insert(job_id.clone(), status.to_string());
                return send(
                    sender,
                    &WsMessage::JobUpdate {
                        job_id,
                        status: status.to_string(),
                        logs: None,
                    },
                )
                .await;
            }
        }
        BusEvent::Log {
            job_id,
            seq,
            stream,
            content,
            ..
        } => {
            if let Some(status) = subscriptions.get(&job_id).cloned() {
                return send(
                    sender,
                    &WsMessage::JobUpdate {
                        job_id,
                        status,
                        logs: Some(vec![LogEntry { seq, stream, content }]),
                    },
                )
                .await;
            }
        }
        BusEvent::RunUpdate { .. } => {}
    }
    Ok(())
}

async fn send(
    sender: &mut (impl SinkExt<Message> + Unpin),
    message: &WsMessage,
) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(message) else {
        return Ok(());
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_update_wire_shape() {
        let message = WsMessage::JobUpdate {
            job_id: "j1".to_string(),
            status: "running".to_string(),
            logs: Some(vec![LogEntry {
                seq: 7,
                stream: "stdout".to_string(),
                content: "hi\n".to_string(),
            }]),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "job_update");
        assert_eq!(value["jobId"], "j1");
        assert_eq!(value["logs"][0]["seq"], 7);
    }

    #[test]
    fn subscribe_command_parses() {
        let command: WsCommand =
            serde_json::from_str(r#"{"type":"subscribe","jobId":"j1"}"#).unwrap();
        assert!(matches!(command, WsCommand::Subscribe { job_id } if job_id == "j1"));
    }

    #[test]
    fn status_only_update_omits_logs() {
        let message = WsMessage::JobUpdate {
            job_id: "j1".to_string(),
            status: "success".to_string(),
            logs: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("logs").is_none());
    }
}
