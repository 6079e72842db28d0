// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/node/connect` — the long-poll WebSocket a node agent holds open.
//! Registers the node in the hub and streams `HubMessage`s as JSON text
//! frames; every inbound packet refreshes the node's liveness.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::state::{epoch_ms, RelayState};
use crate::store::NodeRecord;
use crate::transport::auth::{bearer_token, constant_time_eq};

/// Resolve the node record matching a presented bearer token.
pub fn authenticate_node(state: &RelayState, headers: &HeaderMap) -> Option<NodeRecord> {
    let token = bearer_token(headers)?;
    let nodes = state.store.list_nodes().ok()?;
    nodes.into_iter().find(|n| constant_time_eq(&n.token, token))
}

/// `GET /node/connect` — WebSocket upgrade with node-token auth.
pub async fn node_connect(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(node) = authenticate_node(&state, &headers) else {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    };
    ws.on_upgrade(move |socket| handle_node(state, node, socket)).into_response()
}

async fn handle_node(state: Arc<RelayState>, node: NodeRecord, socket: WebSocket) {
    let (epoch, mut queue_rx) = state.hub.register(&node.name);
    let _ = state.store.touch_node(&node.name, epoch_ms());
    info!(node = %node.name, "node agent connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            queued = queue_rx.recv() => {
                let Some(msg) = queued else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(node = %node.name, err = %e, "hub message encode failed");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Any control-plane packet counts as liveness.
                        let _ = state.store.touch_node(&node.name, epoch_ms());
                    }
                    Some(Err(e)) => {
                        debug!(node = %node.name, err = %e, "node socket error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(&node.name, epoch);
    let _ = state.store.touch_node(&node.name, epoch_ms());
    info!(node = %node.name, "node agent disconnected");
}
