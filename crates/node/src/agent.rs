// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node→relay agent: a long-poll WebSocket that receives bridge requests
//! and, for each, dials back to the relay and pipes a fresh login shell's
//! PTY over the back connection.

use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pty::{Pty, READ_CHUNK};

/// Reconnect backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Messages the relay pushes over `/node/connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubMessage {
    #[serde(rename = "SSHRequest")]
    SshRequest { session_id: String, cols: u16, rows: u16 },
}

/// Agent connection settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay base URL (`http(s)://host:port`); converted to ws(s) for dials.
    pub relay_url: String,
    /// Node token presented as `Authorization: Bearer`.
    pub relay_token: String,
    /// Shell spawned per bridge.
    pub shell: String,
}

/// Spawn the agent loop; it reconnects with exponential backoff until the
/// node shuts down.
pub fn spawn(config: AgentConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run(config, shutdown))
}

async fn run(config: AgentConfig, shutdown: CancellationToken) {
    let mut backoff = BACKOFF_START;
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match connect(&config).await {
            Ok(ws) => {
                backoff = BACKOFF_START;
                info!(relay = %config.relay_url, "relay connected");
                poll_hub(&config, ws, &shutdown).await;
                info!(relay = %config.relay_url, "relay disconnected");
            }
            Err(e) => {
                debug!(relay = %config.relay_url, err = %e, backoff_s = backoff.as_secs(), "relay dial failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(config: &AgentConfig) -> anyhow::Result<WsStream> {
    let url = format!("{}/node/connect", ws_base(&config.relay_url));
    let mut request = url.into_client_request().context("build connect request")?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.relay_token).parse().context("token header")?,
    );
    let (ws, _) = tokio_tungstenite::connect_async(request).await.context("relay dial")?;
    Ok(ws)
}

/// Consume hub messages until the connection drops.
async fn poll_hub(config: &AgentConfig, mut ws: WsStream, shutdown: &CancellationToken) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws.close(None).await;
                return;
            }
            msg = ws.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<HubMessage>(&text) {
                    Ok(HubMessage::SshRequest { session_id, cols, rows }) => {
                        let config = config.clone();
                        let cancel = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = run_bridge(&config, &session_id, cols, rows, cancel).await {
                                warn!(session_id, err = %e, "bridge failed");
                            }
                        });
                    }
                    Err(e) => debug!(err = %e, "unparseable hub message"),
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(err = %e, "hub receive error");
                return;
            }
        }
    }
}

/// One bridge: dial `/node/back/{id}`, spawn the shell on a PTY sized to
/// the request, and copy bytes both ways until either side ends.
async fn run_bridge(
    config: &AgentConfig,
    session_id: &str,
    cols: u16,
    rows: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let url = format!("{}/node/back/{}", ws_base(&config.relay_url), session_id);
    let mut request = url.into_client_request().context("build back request")?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.relay_token).parse().context("token header")?,
    );
    let (ws, _) = tokio_tungstenite::connect_async(request).await.context("back dial")?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_owned());
    let command = vec![config.shell.clone(), "--login".to_owned()];
    let pty = std::sync::Arc::new(
        Pty::spawn(&command, std::path::Path::new(&home), cols, rows)
            .context("bridge shell spawn")?,
    );
    info!(session_id, shell = %config.shell, cols, rows, "bridge shell started");

    // PTY → relay
    let reader_pty = std::sync::Arc::clone(&pty);
    let reader_cancel = cancel.clone();
    let pump_out = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                read = reader_pty.read_chunk(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let body = bytes::Bytes::copy_from_slice(&buf[..n]);
                    if ws_tx.send(Message::Binary(body)).await.is_err() {
                        break;
                    }
                }
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Err(_) => break,
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        reader_cancel.cancel();
    });

    // relay → PTY
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Binary(body))) => {
                if pty.write_all(&body).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }

    // Unblock the PTY reader and let the shell wind down.
    cancel.cancel();
    pty.signal(nix::sys::signal::Signal::SIGHUP);
    let _ = pump_out.await;
    let _ = pty.wait_exit().await;
    debug!(session_id, "bridge closed");
    Ok(())
}

/// Convert the relay base URL to its WebSocket form.
fn ws_base(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_owned()
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
