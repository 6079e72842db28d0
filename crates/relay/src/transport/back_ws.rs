// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/node/back/{session_id}` — the connection a node dials back for one
//! bridge. The socket is wrapped as a byte stream and handed to whichever
//! SSH session is waiting in the pending-bridge table.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bridge::BackConn;
use crate::state::{epoch_ms, RelayState};
use crate::transport::node_ws::authenticate_node;

/// Per-direction buffered chunks between the SSH session and the socket.
const PIPE_DEPTH: usize = 256;

/// `GET /node/back/{session_id}` — WebSocket upgrade with node-token auth.
pub async fn node_back(
    State(state): State<Arc<RelayState>>,
    Path(session_id): Path<String>,
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
    let _ = state.store.touch_node(&node.name, epoch_ms());
    ws.on_upgrade(move |socket| handle_back(state, session_id, socket)).into_response()
}

/// Deliver the socket to the pending bridge, then pump bytes both ways
/// until either side finishes.
async fn handle_back(state: Arc<RelayState>, session_id: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (to_node_tx, mut to_node_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);
    let (from_node_tx, from_node_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);

    let delivered =
        state.bridges.deliver(&session_id, BackConn { tx: to_node_tx, rx: from_node_rx });
    if !delivered {
        debug!(session_id, "back-dial with no waiter, closing");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }
    info!(session_id, "bridge connected");

    loop {
        tokio::select! {
            outbound = to_node_rx.recv() => {
                match outbound {
                    Some(chunk) => {
                        if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                            break;
                        }
                    }
                    // SSH side is done; nothing more will be written.
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Binary(body))) => {
                        if from_node_tx.send(body).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id, err = %e, "back socket error");
                        break;
                    }
                }
            }
        }
    }
    info!(session_id, "bridge closed");
}
