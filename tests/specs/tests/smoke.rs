// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `codewire` and
//! `codewire-relay` binaries and exercise the control socket, the
//! authenticated WebSocket, persistence across restart, and the SSH bridge.

use std::sync::Arc;
use std::time::Duration;

use codewire::frame::Frame;
use codewire::protocol::{Recipient, Request, Response, Status, WaitCondition};
use codewire_specs::{ControlConn, NodeOptions, NodeProcess, RelayProcess};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(15);

fn launch_request(command: &[&str], name: Option<&str>, tags: &[&str]) -> Request {
    Request::Launch {
        command: command.iter().map(|s| (*s).to_owned()).collect(),
        working_dir: Some("/tmp".to_owned()),
        name: name.map(|s| s.to_owned()),
        tags: tags.iter().map(|s| (*s).to_owned()).collect(),
        cols: None,
        rows: None,
    }
}

async fn launch(conn: &mut ControlConn, request: &Request) -> anyhow::Result<u32> {
    match conn.request(request).await? {
        Response::Launched { id } => Ok(id),
        other => anyhow::bail!("expected Launched, got {other:?}"),
    }
}

async fn wait_terminal(conn: &mut ControlConn, id: u32) -> anyhow::Result<Status> {
    let request = Request::Wait {
        id: Some(id),
        tags: Vec::new(),
        condition: WaitCondition::All,
        timeout_s: Some(10),
    };
    match conn.request(&request).await? {
        Response::WaitResult { sessions, timed_out } => {
            anyhow::ensure!(!timed_out, "wait timed out");
            sessions
                .first()
                .map(|s| s.status.clone())
                .ok_or_else(|| anyhow::anyhow!("empty wait result"))
        }
        other => anyhow::bail!("expected WaitResult, got {other:?}"),
    }
}

// -- Control socket -----------------------------------------------------------

#[tokio::test]
async fn launch_and_logs() -> anyhow::Result<()> {
    let node = NodeProcess::start().await?;
    let mut conn = node.control().await?;

    let id = launch(&mut conn, &launch_request(&["/bin/echo", "hello"], None, &[])).await?;
    let status = wait_terminal(&mut conn, id).await?;
    assert_eq!(status, Status::Completed { exit_code: 0 });

    match conn.request(&Request::Logs { id, follow: false, tail: None }).await? {
        Response::LogData { data } => assert!(data.contains("hello"), "logs: {data:?}"),
        other => anyhow::bail!("expected LogData, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn kill_by_tag() -> anyhow::Result<()> {
    let node = NodeProcess::start().await?;
    let mut conn = node.control().await?;

    let a = launch(&mut conn, &launch_request(&["sleep", "30"], None, &["worker"])).await?;
    let b = launch(&mut conn, &launch_request(&["sleep", "30"], None, &["worker"])).await?;

    match conn.request(&Request::KillByTags { tags: vec!["worker".to_owned()] }).await? {
        Response::Killed { count, .. } => assert_eq!(count, Some(2)),
        other => anyhow::bail!("expected Killed, got {other:?}"),
    }
    assert_eq!(wait_terminal(&mut conn, a).await?, Status::Killed);
    assert_eq!(wait_terminal(&mut conn, b).await?, Status::Killed);

    // Killing an already-terminal session is an error reply.
    assert!(matches!(conn.request(&Request::Kill { id: a }).await?, Response::Error { .. }));
    Ok(())
}

#[tokio::test]
async fn attach_concurrent_with_input() -> anyhow::Result<()> {
    let node = NodeProcess::start().await?;
    let mut attach_conn = node.control().await?;

    let id = launch(&mut attach_conn, &launch_request(&["/bin/cat"], None, &[])).await?;

    attach_conn
        .send(&Request::Attach { id, from_offset: Some(0), cols: None, rows: None })
        .await?;
    assert!(matches!(attach_conn.recv_response().await?, Response::Attached { .. }));

    // Input arrives through a second client while the first is attached.
    let mut input_conn = node.control().await?;
    match input_conn.request(&Request::SendInput { id, data: "ab\n".to_owned() }).await? {
        Response::InputSent { bytes } => assert_eq!(bytes, 3),
        other => anyhow::bail!("expected InputSent, got {other:?}"),
    }

    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !String::from_utf8_lossy(&collected).contains("ab") {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "no echo within 1s, got {:?}",
            String::from_utf8_lossy(&collected)
        );
        if let Some(Frame::Data(bytes)) = attach_conn.recv().await? {
            collected.extend_from_slice(&bytes);
        }
    }
    Ok(())
}

#[tokio::test]
async fn zero_length_input() -> anyhow::Result<()> {
    let node = NodeProcess::start().await?;
    let mut conn = node.control().await?;
    let id = launch(&mut conn, &launch_request(&["sleep", "5"], None, &[])).await?;

    match conn.request(&Request::SendInput { id, data: String::new() }).await? {
        Response::InputSent { bytes } => assert_eq!(bytes, 0),
        other => anyhow::bail!("expected InputSent, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn direct_message_round_trip() -> anyhow::Result<()> {
    let node = NodeProcess::start().await?;
    let mut conn = node.control().await?;
    let id =
        launch(&mut conn, &launch_request(&["sleep", "30"], Some("courier"), &[])).await?;

    let sent = conn
        .request(&Request::MsgSend {
            to: Recipient::Name("courier".to_owned()),
            body: "hello courier".to_owned(),
        })
        .await?;
    assert!(matches!(sent, Response::MsgSent { .. }));

    match conn.request(&Request::MsgRead { session: Recipient::Id(id), limit: None }).await? {
        Response::Messages { messages } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].body, "hello courier");
        }
        other => anyhow::bail!("expected Messages, got {other:?}"),
    }
    Ok(())
}

// -- Persistence --------------------------------------------------------------

#[tokio::test]
async fn sessions_survive_restart() -> anyhow::Result<()> {
    let mut node = NodeProcess::start().await?;
    let data_dir = node.data_dir.clone();
    {
        let mut conn = node.control().await?;
        let id =
            launch(&mut conn, &launch_request(&["/bin/echo", "persisted"], Some("build-1"), &[]))
                .await?;
        wait_terminal(&mut conn, id).await?;
        // Let the 500 ms persistence debounce flush before stopping.
        tokio::time::sleep(Duration::from_millis(700)).await;
    }
    node.stop().await?;

    let node = NodeProcess::start_with_dir(data_dir).await?;
    let mut conn = node.control().await?;
    match conn.request(&Request::ListSessions {}).await? {
        Response::Sessions { sessions } => {
            let restored = sessions
                .iter()
                .find(|s| s.name.as_deref() == Some("build-1"))
                .ok_or_else(|| anyhow::anyhow!("build-1 missing after restart: {sessions:?}"))?;
            assert!(restored.status.is_terminal());

            match conn
                .request(&Request::Logs { id: restored.id, follow: false, tail: None })
                .await?
            {
                Response::LogData { data } => assert!(data.contains("persisted")),
                other => anyhow::bail!("expected LogData, got {other:?}"),
            }
        }
        other => anyhow::bail!("expected Sessions, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn second_daemon_refuses_data_dir() -> anyhow::Result<()> {
    let node = NodeProcess::start().await?;

    let output = std::process::Command::new(codewire_specs::node_binary())
        .args(["--data-dir", &node.data_dir.to_string_lossy()])
        .output()?;
    assert_eq!(
        output.status.code(),
        Some(2),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

// -- WebSocket ----------------------------------------------------------------

#[tokio::test]
async fn websocket_carries_frames() -> anyhow::Result<()> {
    let node =
        NodeProcess::start_with_options(NodeOptions { ws: true, ..Default::default() }).await?;
    let port = node.ws_port.ok_or_else(|| anyhow::anyhow!("no ws port"))?;
    let token = node.auth_token()?;

    let url = format!("ws://127.0.0.1:{port}/ws?token={token}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await?;

    ws.send(Message::Binary(Frame::control(&Request::ListSessions {})?.encode())).await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("websocket closed"))??;
        if let Message::Binary(body) = msg {
            let frame = Frame::parse(body).map_err(|e| anyhow::anyhow!("bad frame: {e}"))?;
            let reply: Response = frame.parse_control()?;
            assert!(matches!(reply, Response::Sessions { .. }));
            return Ok(());
        }
    }
}

#[tokio::test]
async fn websocket_rejects_bad_token() -> anyhow::Result<()> {
    let node =
        NodeProcess::start_with_options(NodeOptions { ws: true, ..Default::default() }).await?;
    let port = node.ws_port.ok_or_else(|| anyhow::anyhow!("no ws port"))?;

    let url = format!("ws://127.0.0.1:{port}/ws?token=wrong");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
    Ok(())
}

// -- SSH bridge ---------------------------------------------------------------

struct TrustingClient;

impl russh::client::Handler for TrustingClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[tokio::test]
async fn ssh_bridge_reaches_node_shell() -> anyhow::Result<()> {
    let relay = RelayProcess::start().await?;
    let token = relay.create_node("alpha").await?;
    let _node = NodeProcess::start_with_options(NodeOptions {
        relay_url: Some(relay.base_url()),
        relay_token: Some(token.clone()),
        name: Some("alpha".to_owned()),
        ..Default::default()
    })
    .await?;
    relay.wait_node_connected("alpha", TIMEOUT).await?;

    let config = Arc::new(russh::client::Config::default());
    let mut session =
        russh::client::connect(config, ("127.0.0.1", relay.ssh_port), TrustingClient).await?;
    let auth = session.authenticate_password("alpha", &token).await?;
    anyhow::ensure!(
        matches!(auth, russh::client::AuthResult::Success),
        "ssh auth failed: {auth:?}"
    );

    let mut channel = session.channel_open_session().await?;
    channel.request_pty(false, "xterm", 80, 24, 0, 0, &[]).await?;
    channel.request_shell(true).await?;

    channel.data(&b"echo bridge-marker-$((40+2))\n"[..]).await?;

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !collected.contains("bridge-marker-42") {
        let msg = tokio::time::timeout_at(deadline, channel.wait())
            .await
            .map_err(|_| anyhow::anyhow!("no shell output; got {collected:?}"))?
            .ok_or_else(|| anyhow::anyhow!("channel closed; got {collected:?}"))?;
        if let russh::ChannelMsg::Data { data } = msg {
            collected.push_str(&String::from_utf8_lossy(&data));
        }
    }

    // A clean exit closes the channel from the node side.
    channel.data(&b"exit\n"[..]).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let msg = match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => anyhow::bail!("channel never closed after exit"),
        };
        if matches!(msg, russh::ChannelMsg::Close | russh::ChannelMsg::Eof) {
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn ssh_bridge_node_offline() -> anyhow::Result<()> {
    let relay = RelayProcess::start().await?;
    let token = relay.create_node("beta").await?;
    // No agent ever connects for beta.

    let config = Arc::new(russh::client::Config::default());
    let mut session =
        russh::client::connect(config, ("127.0.0.1", relay.ssh_port), TrustingClient).await?;
    let auth = session.authenticate_password("beta", &token).await?;
    anyhow::ensure!(matches!(auth, russh::client::AuthResult::Success), "auth failed");

    let mut channel = session.channel_open_session().await?;
    channel.request_pty(false, "xterm", 80, 24, 0, 0, &[]).await?;
    channel.request_shell(true).await?;

    let mut stderr = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let msg = match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => anyhow::bail!("channel never closed; stderr so far: {stderr:?}"),
        };
        match msg {
            russh::ChannelMsg::ExtendedData { data, ext: 1 } => {
                stderr.push_str(&String::from_utf8_lossy(&data));
            }
            russh::ChannelMsg::Close => break,
            _ => {}
        }
    }
    assert!(stderr.contains("node not connected"), "stderr: {stderr:?}");
    Ok(())
}

#[tokio::test]
async fn ssh_rejects_wrong_token() -> anyhow::Result<()> {
    let relay = RelayProcess::start().await?;
    let _token = relay.create_node("gamma").await?;

    let config = Arc::new(russh::client::Config::default());
    let mut session =
        russh::client::connect(config, ("127.0.0.1", relay.ssh_port), TrustingClient).await?;
    let auth = session.authenticate_password("gamma", "not-the-token").await?;
    anyhow::ensure!(
        !matches!(auth, russh::client::AuthResult::Success),
        "wrong token must not authenticate"
    );
    Ok(())
}
