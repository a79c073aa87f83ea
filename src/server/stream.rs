//! WebSocket live-tail endpoint.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::handlers::AppState;
use crate::labels::LabelSet;

/// In-band control message from a subscriber.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    labels: Option<LabelSet>,
}

/// Handle GET /stream: upgrade and attach to the tail hub.
///
/// Query-string parameters other than `query` form the initial label
/// filter.
pub async fn handle_stream(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let mut filter = LabelSet::new();
    for (key, value) in params {
        if key != "query" {
            filter.insert(key, value);
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(socket: WebSocket, state: AppState, filter: LabelSet) {
    let (subscriber_id, mut outbound) = state.hub.register(filter);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!("failed to encode tail message: {}", err);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break; // client disconnected
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_control(&state, subscriber_id, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(subscriber_id);
}

/// Applies a `{"type": "filter", "labels": {...}}` control message; other
/// messages are ignored.
fn handle_control(state: &AppState, subscriber_id: u64, text: &str) {
    let Ok(control) = serde_json::from_str::<ControlMessage>(text) else {
        return;
    };
    if control.kind == "filter" {
        let filter = control.labels.unwrap_or_default();
        state.hub.update_filter(subscriber_id, filter);
    }
}
