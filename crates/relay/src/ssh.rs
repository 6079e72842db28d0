// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSH front-end: username = node name, password = node token. Accepted
//! shell/exec requests are bridged to the target node through the hub and
//! the pending-bridge table.
//!
//! The host key is a fresh ed25519 key per process start; clients
//! authenticate the relay by token possession, not host-key pinning.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rand::RngCore;
use russh::keys::Algorithm;
use russh::server::{Auth, Config, Handle, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bridge::BackConn;
use crate::hub::HubMessage;
use crate::state::{epoch_ms, RelayState};
use crate::store::BridgeRecord;
use crate::transport::auth::constant_time_eq;

/// Buffered keystrokes between the SSH channel and the back connection.
const CHANNEL_DEPTH: usize = 256;

/// Run the SSH listener until shutdown.
pub async fn run_ssh(state: Arc<RelayState>) -> anyhow::Result<()> {
    let host_key = russh::keys::PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
        .context("generate host key")?;
    let config = Arc::new(Config {
        auth_rejection_time: Duration::from_millis(500),
        keys: vec![host_key],
        ..Default::default()
    });

    let addr = format!("{}:{}", state.config.host, state.config.ssh_port);
    info!(addr, "ssh front-end listening");
    let mut server = SshFrontEnd { state };
    server
        .run_on_address(config, addr)
        .await
        .context("ssh listener failed")?;
    Ok(())
}

struct SshFrontEnd {
    state: Arc<RelayState>,
}

impl Server for SshFrontEnd {
    type Handler = SshHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshHandler {
        SshHandler {
            state: Arc::clone(&self.state),
            node: None,
            channels: HashMap::new(),
            peer,
        }
    }
}

/// Per-channel bridge state.
struct ChannelBridge {
    cols: u16,
    rows: u16,
    /// Keystrokes toward the node; dropping it signals client departure.
    to_node: Option<mpsc::Sender<Bytes>>,
    started: bool,
}

pub struct SshHandler {
    state: Arc<RelayState>,
    node: Option<String>,
    channels: HashMap<ChannelId, ChannelBridge>,
    peer: Option<SocketAddr>,
}

impl Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let record = self.state.store.get_node(user)?;
        let expected = record.as_ref().map(|r| r.token.as_str()).unwrap_or("");
        if record.is_some() && constant_time_eq(expected, password) {
            self.node = Some(user.to_owned());
            let _ = self.state.store.touch_node(user, epoch_ms());
            info!(node = user, peer = ?self.peer, "ssh authenticated");
            Ok(Auth::Accept)
        } else {
            debug!(user, peer = ?self.peer, "ssh auth rejected");
            Ok(Auth::Reject { proceed_with_methods: None, partial_success: false })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            ChannelBridge { cols: 80, rows: 24, to_node: None, started: false },
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.channels.get_mut(&channel) {
            bridge.cols = clamp_dim(col_width, 80);
            bridge.rows = clamp_dim(row_height, 24);
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_bridge(channel, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The exec command line is not forwarded in v1; the bridge opens
        // the node's configured shell either way.
        self.start_bridge(channel, session)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.channels.get(&channel).and_then(|b| b.to_node.clone()) {
            let _ = tx.send(Bytes::copy_from_slice(data)).await;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Accepted but not forwarded in v1.
        if let Some(bridge) = self.channels.get_mut(&channel) {
            bridge.cols = clamp_dim(col_width, 80);
            bridge.rows = clamp_dim(row_height, 24);
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.release_channel(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.release_channel(channel);
        Ok(())
    }
}

impl SshHandler {
    /// Kick off bridging for a shell/exec request: register the pending
    /// bridge, notify the node through the hub, and hand the wait to a
    /// detached pump task.
    fn start_bridge(&mut self, channel: ChannelId, session: &mut Session) -> anyhow::Result<()> {
        let node = self.node.clone().ok_or_else(|| anyhow::anyhow!("shell before auth"))?;
        let Some(bridge) = self.channels.get_mut(&channel) else {
            anyhow::bail!("shell request on unknown channel");
        };
        if bridge.started {
            session.channel_success(channel)?;
            return Ok(());
        }
        bridge.started = true;

        let session_id = new_bridge_id();
        let (cols, rows) = (bridge.cols, bridge.rows);
        let (to_node_tx, to_node_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        bridge.to_node = Some(to_node_tx);

        let expect_rx = self.state.bridges.expect(&session_id);
        let handle = session.handle();
        session.channel_success(channel)?;

        let request =
            HubMessage::SshRequest { session_id: session_id.clone(), cols, rows };
        if let Err(e) = self.state.hub.send(&node, request) {
            warn!(node, session_id, err = %e, "bridge request undeliverable");
            self.state.bridges.cancel(&session_id);
            audit_bridge(&self.state, &node, &session_id, false);
            tokio::spawn(async move {
                let msg = CryptoVec::from_slice(b"node not connected\r\n");
                let _ = handle.extended_data(channel, 1, msg).await;
                let _ = handle.close(channel).await;
            });
            return Ok(());
        }

        debug!(node, session_id, cols, rows, "bridge requested");
        let state = Arc::clone(&self.state);
        tokio::spawn(pump_bridge(state, node, session_id, channel, handle, expect_rx, to_node_rx));
        Ok(())
    }

    /// Drop the channel's sender: the pump sends Ctrl-D to the node and
    /// drains the remaining output.
    fn release_channel(&mut self, channel: ChannelId) {
        if let Some(bridge) = self.channels.get_mut(&channel) {
            bridge.to_node = None;
        }
    }
}

/// Wait for the node's back-dial, then copy bytes both ways until either
/// side finishes.
async fn pump_bridge(
    state: Arc<RelayState>,
    node: String,
    session_id: String,
    channel: ChannelId,
    handle: Handle,
    expect_rx: oneshot::Receiver<BackConn>,
    mut to_node_rx: mpsc::Receiver<Bytes>,
) {
    let conn = match tokio::time::timeout(state.config.bridge_timeout(), expect_rx).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(_)) | Err(_) => {
            info!(node, session_id, "bridge timed out waiting for back-dial");
            state.bridges.cancel(&session_id);
            audit_bridge(&state, &node, &session_id, false);
            let msg = CryptoVec::from_slice(b"node not connected\r\n");
            let _ = handle.extended_data(channel, 1, msg).await;
            let _ = handle.close(channel).await;
            return;
        }
    };
    audit_bridge(&state, &node, &session_id, true);

    let BackConn { tx: node_tx, rx: mut node_rx } = conn;

    // SSH keystrokes → node. When the client side closes, Ctrl-D tells the
    // remote shell to wind down, then the output direction drains.
    let forward = tokio::spawn(async move {
        while let Some(chunk) = to_node_rx.recv().await {
            if node_tx.send(chunk).await.is_err() {
                break;
            }
        }
        let _ = node_tx.send(Bytes::from_static(&[0x04])).await;
    });

    // Node output → SSH channel.
    while let Some(chunk) = node_rx.recv().await {
        if handle.data(channel, CryptoVec::from_slice(&chunk)).await.is_err() {
            break;
        }
    }

    let _ = handle.eof(channel).await;
    let _ = handle.exit_status_request(channel, 0).await;
    let _ = handle.close(channel).await;
    let _ = forward.await;
    debug!(node, session_id, "bridge pump finished");
}

fn audit_bridge(state: &RelayState, node: &str, session_id: &str, connected: bool) {
    let record = BridgeRecord {
        session_id: session_id.to_owned(),
        node: node.to_owned(),
        started_at_ms: epoch_ms(),
        connected,
    };
    if let Err(e) = state.store.record_bridge(record) {
        debug!(err = %e, "bridge audit write failed");
    }
}

/// 16 random bytes, hex encoded.
pub fn new_bridge_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn clamp_dim(value: u32, fallback: u16) -> u16 {
    if value == 0 || value > u16::MAX as u32 {
        fallback
    } else {
        value as u16
    }
}

#[cfg(test)]
#[path = "ssh_tests.rs"]
mod tests;
