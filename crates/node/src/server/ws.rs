// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated WebSocket listener carrying the framed protocol, one frame
//! per binary message.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::auth::validate_token;
use super::CONN_DEPTH;
use crate::frame::Frame;
use crate::handler::{serve, HandlerContext};
use crate::protocol::Response;

/// Shared state for the WebSocket routes.
pub struct WsState {
    pub ctx: HandlerContext,
    pub auth_token: String,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Bind the TCP listener and spawn the axum server.
pub async fn spawn_listener(
    ctx: HandlerContext,
    addr: &str,
    auth_token: String,
) -> anyhow::Result<()> {
    let shutdown = ctx.shutdown.clone();
    let state = Arc::new(WsState { ctx, auth_token });
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr, "websocket listening");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
    });
    Ok(())
}

/// `GET /ws?token=...` — upgrade after a constant-time token check.
pub async fn ws_handler(
    State(state): State<Arc<WsState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !validate_token(query.token.as_deref(), &state.auth_token) {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(state, socket)).into_response()
}

/// Pump frames between the socket and a handler task.
async fn handle_connection(state: Arc<WsState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = state.ctx.shutdown.child_token();

    let (in_tx, in_rx) = mpsc::channel(CONN_DEPTH);
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CONN_DEPTH);

    let reader_out = out_tx.clone();
    let reader_cancel = cancel.clone();
    let read_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(body))) => match Frame::parse(body) {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(err = %e, "framing error on websocket");
                        let reply = Response::error(format!("protocol error: {e}"));
                        if let Ok(frame) = Frame::control(&reply) {
                            let _ = reader_out.send(frame).await;
                        }
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // text/ping/pong ignored
                Some(Err(e)) => {
                    debug!(err = %e, "websocket receive error");
                    break;
                }
            }
        }
    });

    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    serve(state.ctx.clone(), in_rx, out_tx).await;

    cancel.cancel();
    let _ = read_task.await;
    let _ = write_task.await;
    debug!("websocket connection closed");
}
