// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::manager::ManagerConfig;
use crate::protocol::{Status, WaitCondition};

struct TestConn {
    to_handler: mpsc::Sender<Frame>,
    from_handler: mpsc::Receiver<Frame>,
    _dir: tempfile::TempDir,
    ctx: HandlerContext,
}

fn start() -> anyhow::Result<TestConn> {
    let dir = tempfile::tempdir()?;
    let (manager, _persist_rx) = Manager::new(ManagerConfig {
        data_dir: dir.path().to_path_buf(),
        buffer_capacity: 65536,
    });
    let kv = Arc::new(KvStore::open(dir.path().join("kv.json"))?);
    let ctx = HandlerContext { manager, kv, shutdown: CancellationToken::new() };

    let (to_handler, handler_rx) = mpsc::channel(64);
    let (handler_tx, from_handler) = mpsc::channel(64);
    tokio::spawn(serve(ctx.clone(), handler_rx, handler_tx));

    Ok(TestConn { to_handler, from_handler, _dir: dir, ctx })
}

impl TestConn {
    async fn request(&mut self, request: &Request) -> anyhow::Result<Response> {
        self.send(request).await?;
        self.recv_control().await
    }

    async fn send(&self, request: &Request) -> anyhow::Result<()> {
        self.to_handler.send(Frame::control(request)?).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> anyhow::Result<Frame> {
        tokio::time::timeout(Duration::from_secs(10), self.from_handler.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("handler closed"))
    }

    async fn recv_control(&mut self) -> anyhow::Result<Response> {
        loop {
            let frame = self.recv_frame().await?;
            if matches!(frame, Frame::Control(_)) {
                return Ok(frame.parse_control()?);
            }
        }
    }

    async fn launch(&mut self, command: &[&str]) -> anyhow::Result<u32> {
        self.launch_tagged(command, &[]).await
    }

    async fn launch_tagged(&mut self, command: &[&str], tags: &[&str]) -> anyhow::Result<u32> {
        let reply = self
            .request(&Request::Launch {
                command: command.iter().map(|s| (*s).to_owned()).collect(),
                working_dir: Some("/tmp".to_owned()),
                name: None,
                tags: tags.iter().map(|s| (*s).to_owned()).collect(),
                cols: None,
                rows: None,
            })
            .await?;
        match reply {
            Response::Launched { id } => Ok(id),
            other => anyhow::bail!("expected Launched, got {other:?}"),
        }
    }

    async fn wait_terminal(&mut self, id: u32) -> anyhow::Result<Status> {
        let reply = self
            .request(&Request::Wait {
                id: Some(id),
                tags: Vec::new(),
                condition: WaitCondition::All,
                timeout_s: Some(10),
            })
            .await?;
        match reply {
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
}

#[tokio::test]
async fn launch_then_logs_contains_output() -> anyhow::Result<()> {
    let mut conn = start()?;
    let id = conn.launch(&["/bin/echo", "hello"]).await?;
    let status = conn.wait_terminal(id).await?;
    assert_eq!(status, Status::Completed { exit_code: 0 });

    let reply = conn.request(&Request::Logs { id, follow: false, tail: None }).await?;
    match reply {
        Response::LogData { data } => assert!(data.contains("hello"), "logs: {data:?}"),
        other => anyhow::bail!("expected LogData, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn kill_by_tags_then_kill_errors() -> anyhow::Result<()> {
    let mut conn = start()?;
    let a = conn.launch_tagged(&["sleep", "30"], &["worker"]).await?;
    let _b = conn.launch_tagged(&["sleep", "30"], &["worker"]).await?;

    let reply = conn.request(&Request::KillByTags { tags: vec!["worker".to_owned()] }).await?;
    match reply {
        Response::Killed { count, .. } => assert_eq!(count, Some(2)),
        other => anyhow::bail!("expected Killed, got {other:?}"),
    }
    assert_eq!(conn.wait_terminal(a).await?, Status::Killed);

    let reply = conn.request(&Request::Kill { id: a }).await?;
    assert!(matches!(reply, Response::Error { .. }));
    Ok(())
}

#[tokio::test]
async fn zero_length_input_succeeds() -> anyhow::Result<()> {
    let mut conn = start()?;
    let id = conn.launch(&["cat"]).await?;

    let reply = conn.request(&Request::SendInput { id, data: String::new() }).await?;
    match reply {
        Response::InputSent { bytes } => assert_eq!(bytes, 0),
        other => anyhow::bail!("expected InputSent, got {other:?}"),
    }

    conn.request(&Request::Kill { id }).await?;
    Ok(())
}

#[tokio::test]
async fn attach_streams_input_echo() -> anyhow::Result<()> {
    let mut conn = start()?;
    let id = conn.launch(&["cat"]).await?;

    let reply = conn
        .request(&Request::Attach { id, from_offset: Some(0), cols: None, rows: None })
        .await?;
    assert!(matches!(reply, Response::Attached { .. }));

    conn.to_handler.send(Frame::Data(Bytes::from_static(b"ab\n"))).await?;

    // Within a second the attached stream must yield the bytes back
    // (tty echo or cat output).
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !String::from_utf8_lossy(&collected).contains("ab") {
        let frame = tokio::time::timeout_at(deadline, conn.from_handler.recv())
            .await
            .map_err(|_| anyhow::anyhow!("no echo within 1s; got {collected:?}"))?
            .ok_or_else(|| anyhow::anyhow!("stream closed"))?;
        if let Frame::Data(bytes) = frame {
            collected.extend_from_slice(&bytes);
        }
    }

    conn.ctx.manager.kill(id)?;
    Ok(())
}

#[tokio::test]
async fn watch_ends_with_status() -> anyhow::Result<()> {
    let mut conn = start()?;
    let id = conn.launch(&["/bin/echo", "watched"]).await?;

    conn.send(&Request::WatchSession { id, include_history: true, history_lines: None }).await?;

    let mut output = String::new();
    loop {
        let reply = conn.recv_control().await?;
        match reply {
            Response::WatchUpdate { output: chunk, done: false, .. } => output.push_str(&chunk),
            Response::WatchUpdate { done: true, status, .. } => {
                assert_eq!(status, Some(Status::Completed { exit_code: 0 }));
                break;
            }
            other => anyhow::bail!("expected WatchUpdate, got {other:?}"),
        }
    }
    assert!(output.contains("watched"), "watch output: {output:?}");
    Ok(())
}

#[tokio::test]
async fn subscribe_emits_created_and_status() -> anyhow::Result<()> {
    let mut conn = start()?;
    let reply = conn
        .request(&Request::Subscribe {
            session_id: None,
            tags: Vec::new(),
            event_types: Vec::new(),
            timeout_s: None,
        })
        .await?;
    assert!(matches!(reply, Response::SubscribeAck {}));

    // Launch through a second connection while the first streams events.
    let (to_handler, handler_rx) = mpsc::channel(64);
    let (handler_tx, _keep) = mpsc::channel(64);
    tokio::spawn(serve(conn.ctx.clone(), handler_rx, handler_tx));
    to_handler
        .send(Frame::control(&Request::Launch {
            command: vec!["/bin/echo".to_owned(), "evt".to_owned()],
            working_dir: Some("/tmp".to_owned()),
            name: None,
            tags: Vec::new(),
            cols: None,
            rows: None,
        })?)
        .await?;

    let mut saw_created = false;
    let mut saw_terminal = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !(saw_created && saw_terminal) {
        let frame = tokio::time::timeout_at(deadline, conn.from_handler.recv())
            .await
            .map_err(|_| anyhow::anyhow!("missing events"))?
            .ok_or_else(|| anyhow::anyhow!("stream closed"))?;
        let Frame::Control(_) = &frame else { continue };
        match frame.parse_control::<Response>()? {
            Response::Event { event: SessionEvent::Created { .. }, .. } => saw_created = true,
            Response::Event { event: SessionEvent::Status { status }, .. } => {
                saw_terminal = status.is_terminal();
            }
            _ => {}
        }
    }
    Ok(())
}

#[tokio::test]
async fn msg_send_read_round_trip() -> anyhow::Result<()> {
    let mut conn = start()?;
    let id = conn.launch(&["sleep", "30"]).await?;

    let reply = conn
        .request(&Request::MsgSend { to: Recipient::Id(id), body: "ping".to_owned() })
        .await?;
    let Response::MsgSent { message_id } = reply else {
        anyhow::bail!("expected MsgSent, got {reply:?}")
    };

    let reply =
        conn.request(&Request::MsgRead { session: Recipient::Id(id), limit: None }).await?;
    match reply {
        Response::Messages { messages } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].id, message_id);
            assert_eq!(messages[0].body, "ping");
        }
        other => anyhow::bail!("expected Messages, got {other:?}"),
    }

    conn.ctx.manager.kill(id)?;
    Ok(())
}

#[tokio::test]
async fn msg_request_times_out_distinctly() -> anyhow::Result<()> {
    let mut conn = start()?;
    let id = conn.launch(&["sleep", "30"]).await?;

    let reply = conn
        .request(&Request::MsgRequest {
            to: Recipient::Id(id),
            body: "anyone there?".to_owned(),
            from: None,
            timeout_s: Some(1),
        })
        .await?;
    match reply {
        Response::MsgResponse { reply, timed_out, .. } => {
            assert!(timed_out);
            assert!(reply.is_none());
        }
        other => anyhow::bail!("expected MsgResponse, got {other:?}"),
    }

    conn.ctx.manager.kill(id)?;
    Ok(())
}

#[tokio::test]
async fn kv_round_trip() -> anyhow::Result<()> {
    let mut conn = start()?;
    let reply = conn
        .request(&Request::KvPut { key: "cfg".to_owned(), value: serde_json::json!({"a": 1}) })
        .await?;
    assert!(matches!(reply, Response::KvOk {}));

    let reply = conn.request(&Request::KvGet { key: "cfg".to_owned() }).await?;
    match reply {
        Response::KvValue { value, .. } => assert_eq!(value["a"], 1),
        other => anyhow::bail!("expected KvValue, got {other:?}"),
    }

    let reply = conn.request(&Request::KvList {}).await?;
    match reply {
        Response::KvKeys { keys } => assert_eq!(keys, vec!["cfg".to_owned()]),
        other => anyhow::bail!("expected KvKeys, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn malformed_request_closes_connection() -> anyhow::Result<()> {
    let conn = start()?;
    let bogus = Frame::Control(Bytes::from_static(br#"{"type":"NoSuchThing"}"#));
    conn.to_handler.send(bogus).await?;

    let mut from_handler = conn.from_handler;
    let frame = tokio::time::timeout(Duration::from_secs(5), from_handler.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("expected error reply"))?;
    let reply: Response = frame.parse_control()?;
    assert!(matches!(reply, Response::Error { .. }));

    // The handler hangs up after a protocol error.
    let closed = tokio::time::timeout(Duration::from_secs(5), from_handler.recv()).await?;
    assert!(closed.is_none());
    Ok(())
}
