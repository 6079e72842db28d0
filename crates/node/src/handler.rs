// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection protocol handler.
//!
//! Transports (Unix socket, WebSocket) pump raw frames into and out of a
//! pair of channels; the handler is transport-agnostic. Requests are served
//! one at a time; streaming requests (logs -f, attach, watch, subscribe)
//! take over the connection until they finish or the client goes away.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::kv::KvStore;
use crate::manager::{epoch_ms, LaunchSpec, Manager};
use crate::protocol::{
    Recipient, Request, Response, SessionEvent, LOGS_DEFAULT_MAX, MSG_BODY_MAX, MSG_READ_DEFAULT,
    MSG_REQUEST_TIMEOUT_S, WATCH_DEFAULT_MAX,
};
use crate::session::{OutputChunk, Session, SubscribeFrom, Subscriber};

/// Dependencies shared by every connection.
#[derive(Clone)]
pub struct HandlerContext {
    pub manager: Arc<Manager>,
    pub kv: Arc<KvStore>,
    pub shutdown: CancellationToken,
}

/// Why the request loop ended.
enum LoopExit {
    /// Peer closed or streaming takeover finished the connection.
    Closed,
    /// Framing/protocol violation: an `Error` was sent, close now.
    Protocol,
}

/// Serve one framed connection until it closes.
///
/// `rx` yields inbound frames; `tx` carries outbound frames. Dropping them
/// (transport gone) releases every subscriber and waiter this handler owns.
pub async fn serve(ctx: HandlerContext, mut rx: mpsc::Receiver<Frame>, tx: mpsc::Sender<Frame>) {
    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let request = match frame {
            Frame::Control(_) => match frame.parse_control::<Request>() {
                Ok(request) => request,
                Err(e) => {
                    let _ = send(&tx, &Response::error(format!("bad request: {e}"))).await;
                    break;
                }
            },
            Frame::Data(_) => {
                let _ = send(&tx, &Response::error("unexpected DATA frame")).await;
                break;
            }
        };

        debug!(request = request_name(&request), "dispatch");
        match dispatch(&ctx, request, &mut rx, &tx).await {
            Ok(()) => {}
            Err(LoopExit::Closed) | Err(LoopExit::Protocol) => break,
        }
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Launch { .. } => "Launch",
        Request::Kill { .. } => "Kill",
        Request::KillByTags { .. } => "KillByTags",
        Request::ListSessions {} => "ListSessions",
        Request::GetStatus { .. } => "GetStatus",
        Request::Logs { .. } => "Logs",
        Request::SendInput { .. } => "SendInput",
        Request::Resize { .. } => "Resize",
        Request::Attach { .. } => "Attach",
        Request::WatchSession { .. } => "WatchSession",
        Request::Subscribe { .. } => "Subscribe",
        Request::Wait { .. } => "Wait",
        Request::MsgSend { .. } => "MsgSend",
        Request::MsgRead { .. } => "MsgRead",
        Request::MsgRequest { .. } => "MsgRequest",
        Request::MsgReply { .. } => "MsgReply",
        Request::KvGet { .. } => "KvGet",
        Request::KvPut { .. } => "KvPut",
        Request::KvDelete { .. } => "KvDelete",
        Request::KvList {} => "KvList",
        Request::Prune { .. } => "Prune",
        Request::PruneByTags { .. } => "PruneByTags",
    }
}

async fn dispatch(
    ctx: &HandlerContext,
    request: Request,
    rx: &mut mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), LoopExit> {
    match request {
        Request::Launch { command, working_dir, name, tags, cols, rows } => {
            let spec = LaunchSpec { command, working_dir, name, tags, cols, rows };
            let reply = match ctx.manager.launch(spec) {
                Ok(id) => Response::Launched { id },
                Err(e) => Response::error(e.to_string()),
            };
            send(tx, &reply).await
        }

        Request::Kill { id } => {
            let reply = match ctx.manager.kill(id) {
                Ok(()) => Response::Killed { id: Some(id), count: None },
                Err(e) => Response::error(e.to_string()),
            };
            send(tx, &reply).await
        }

        Request::KillByTags { tags } => {
            let count = ctx.manager.kill_by_tags(&tags);
            send(tx, &Response::Killed { id: None, count: Some(count) }).await
        }

        Request::ListSessions {} => {
            send(tx, &Response::Sessions { sessions: ctx.manager.list() }).await
        }

        Request::GetStatus { id } => {
            let reply = match ctx.manager.get(id) {
                Some(session) => Response::SessionStatus {
                    info: session.info(),
                    output_size: session.buffer().end_offset(),
                },
                None => Response::error(format!("session {id} not found")),
            };
            send(tx, &reply).await
        }

        Request::Logs { id, follow, tail } => {
            let Some(session) = ctx.manager.get(id) else {
                return send(tx, &Response::error(format!("session {id} not found"))).await;
            };
            if follow {
                follow_logs(session, tail, rx, tx).await
            } else {
                let data = collect_logs(&session, tail);
                send(tx, &Response::LogData { data }).await
            }
        }

        Request::SendInput { id, data } => {
            let Some(session) = ctx.manager.get(id) else {
                return send(tx, &Response::error(format!("session {id} not found"))).await;
            };
            let reply = match session.send_input(data.as_bytes()).await {
                Ok(bytes) => Response::InputSent { bytes },
                Err(e) => Response::error(e.to_string()),
            };
            send(tx, &reply).await
        }

        Request::Resize { id, cols, rows } => {
            let Some(session) = ctx.manager.get(id) else {
                return send(tx, &Response::error(format!("session {id} not found"))).await;
            };
            let reply = match session.resize(cols, rows) {
                Ok(()) => Response::Resized { cols, rows },
                Err(e) => Response::error(e.to_string()),
            };
            send(tx, &reply).await
        }

        Request::Attach { id, from_offset, cols, rows } => {
            let Some(session) = ctx.manager.get(id) else {
                return send(tx, &Response::error(format!("session {id} not found"))).await;
            };
            attach(session, from_offset, cols, rows, rx, tx).await
        }

        Request::WatchSession { id, include_history, history_lines } => {
            let Some(session) = ctx.manager.get(id) else {
                return send(tx, &Response::error(format!("session {id} not found"))).await;
            };
            watch(session, include_history, history_lines, rx, tx).await
        }

        Request::Subscribe { session_id, tags, event_types, timeout_s } => {
            // Register before acking so no event can slip past the client.
            let events_rx = ctx.manager.subscribe_events();
            send(tx, &Response::SubscribeAck {}).await?;
            let deadline =
                timeout_s.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
            subscribe(ctx, events_rx, session_id, tags, event_types, deadline, rx, tx).await
        }

        Request::Wait { id, tags, condition, timeout_s } => {
            let timeout = timeout_s.map(Duration::from_secs);
            let (sessions, timed_out) = ctx.manager.wait(id, &tags, condition, timeout).await;
            send(tx, &Response::WaitResult { sessions, timed_out }).await
        }

        Request::MsgSend { to, body } => {
            if body.len() > MSG_BODY_MAX {
                return send(tx, &Response::error("message body exceeds 64 KiB")).await;
            }
            let Some(session) = ctx.manager.resolve(&to) else {
                return send(tx, &Response::error(recipient_missing(&to))).await;
            };
            let message_id = ctx.manager.inboxes.send(
                session.meta.id,
                recipient_label(&session),
                None,
                body,
                epoch_ms(),
            );
            let _ = ctx.manager.events_tx().send((
                session.meta.id,
                SessionEvent::Inbox {
                    message_id: message_id.clone(),
                    kind: crate::protocol::MessageKind::Message,
                },
            ));
            send(tx, &Response::MsgSent { message_id }).await
        }

        Request::MsgRead { session, limit } => {
            let Some(session) = ctx.manager.resolve(&session) else {
                return send(tx, &Response::error(recipient_missing(&session))).await;
            };
            let messages =
                ctx.manager.inboxes.read(session.meta.id, limit.unwrap_or(MSG_READ_DEFAULT));
            send(tx, &Response::Messages { messages }).await
        }

        Request::MsgRequest { to, body, from, timeout_s } => {
            if body.len() > MSG_BODY_MAX {
                return send(tx, &Response::error("message body exceeds 64 KiB")).await;
            }
            let Some(session) = ctx.manager.resolve(&to) else {
                return send(tx, &Response::error(recipient_missing(&to))).await;
            };
            let from_label = from
                .as_ref()
                .and_then(|r| ctx.manager.resolve(r))
                .map(|s| recipient_label(&s));
            let (request_id, reply_rx) = ctx.manager.inboxes.request(
                session.meta.id,
                recipient_label(&session),
                from_label,
                body,
                epoch_ms(),
            );
            let _ = ctx.manager.events_tx().send((
                session.meta.id,
                SessionEvent::Inbox {
                    message_id: request_id.clone(),
                    kind: crate::protocol::MessageKind::Request,
                },
            ));

            let timeout = Duration::from_secs(timeout_s.unwrap_or(MSG_REQUEST_TIMEOUT_S));
            let reply = match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(reply)) => Response::MsgResponse {
                    request_id,
                    reply: Some(reply),
                    timed_out: false,
                },
                Ok(Err(_)) | Err(_) => {
                    ctx.manager.inboxes.cancel_waiter(&request_id);
                    Response::MsgResponse { request_id, reply: None, timed_out: true }
                }
            };
            send(tx, &reply).await
        }

        Request::MsgReply { request_id, body } => {
            if body.len() > MSG_BODY_MAX {
                return send(tx, &Response::error("message body exceeds 64 KiB")).await;
            }
            let delivered = ctx.manager.inboxes.reply(&request_id, body, None, epoch_ms());
            send(tx, &Response::Replied { delivered }).await
        }

        Request::KvGet { key } => {
            let value = ctx.kv.get(&key);
            send(tx, &Response::KvValue { key, value }).await
        }

        Request::KvPut { key, value } => {
            let reply = match ctx.kv.put(key, value) {
                Ok(()) => Response::KvOk {},
                Err(e) => Response::error(e.to_string()),
            };
            send(tx, &reply).await
        }

        Request::KvDelete { key } => {
            let reply = match ctx.kv.delete(&key) {
                Ok(_) => Response::KvOk {},
                Err(e) => Response::error(e.to_string()),
            };
            send(tx, &reply).await
        }

        Request::KvList {} => send(tx, &Response::KvKeys { keys: ctx.kv.keys() }).await,

        Request::Prune { id } => {
            let count = ctx.manager.prune(id);
            send(tx, &Response::Pruned { count }).await
        }

        Request::PruneByTags { tags } => {
            let count = ctx.manager.prune_by_tags(&tags);
            send(tx, &Response::Pruned { count }).await
        }
    }
}

/// History for `Logs{follow: false}`: the requested tail, clamped to the
/// default cap.
fn collect_logs(session: &Session, tail: Option<usize>) -> String {
    let buffer = session.buffer();
    let from = match tail {
        Some(lines) => buffer.tail_offset(lines),
        None => buffer.oldest_offset(),
    };
    let mut bytes = match buffer.read_from(from) {
        crate::ring::ReadFrom::Data(bytes) => bytes,
        crate::ring::ReadFrom::Truncated { start, .. } => match buffer.read_from(start) {
            crate::ring::ReadFrom::Data(bytes) => bytes,
            crate::ring::ReadFrom::Truncated { .. } => Vec::new(),
        },
    };
    if bytes.len() > LOGS_DEFAULT_MAX {
        let cut = bytes.len() - LOGS_DEFAULT_MAX;
        bytes.drain(..cut);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Stream DATA frames for `Logs{follow: true}` until the client closes or
/// the session reaches terminal status.
async fn follow_logs(
    session: Arc<Session>,
    tail: Option<usize>,
    rx: &mut mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), LoopExit> {
    let from = match tail {
        Some(lines) => SubscribeFrom::TailLines(lines),
        None => SubscribeFrom::Offset(session.buffer().oldest_offset()),
    };
    let mut sub = session.subscribe(from, true);
    stream_output(&mut sub, rx, tx).await?;
    Ok(())
}

/// Bidirectional attach: session output as DATA frames out, client DATA
/// frames into the PTY, interleaved `Resize` control frames honored.
/// The connection is consumed: it closes when either side finishes.
async fn attach(
    session: Arc<Session>,
    from_offset: Option<u64>,
    cols: Option<u16>,
    rows: Option<u16>,
    rx: &mut mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), LoopExit> {
    if let (Some(cols), Some(rows)) = (cols, rows) {
        if let Err(e) = session.resize(cols, rows) {
            debug!(session_id = session.meta.id, err = %e, "attach resize skipped");
        }
    }

    let from = from_offset.unwrap_or(0);
    send(tx, &Response::Attached { id: session.meta.id, from_offset: from }).await?;

    let mut sub = session.subscribe(SubscribeFrom::Offset(from), true);
    loop {
        tokio::select! {
            chunk = sub.rx.recv() => {
                match chunk {
                    Some(OutputChunk::Data { bytes, .. }) => {
                        for frame in Frame::split_data(bytes) {
                            if tx.send(frame).await.is_err() {
                                return Err(LoopExit::Closed);
                            }
                        }
                    }
                    Some(OutputChunk::Truncated { dropped }) => {
                        let marker = Bytes::from(format!("[truncated {dropped} bytes]"));
                        if tx.send(Frame::Data(marker)).await.is_err() {
                            return Err(LoopExit::Closed);
                        }
                    }
                    Some(OutputChunk::Closed { .. }) | None => return Err(LoopExit::Closed),
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(Frame::Data(payload)) => {
                        if let Err(e) = session.send_input(&payload).await {
                            debug!(session_id = session.meta.id, err = %e, "attach input dropped");
                        }
                    }
                    Some(control @ Frame::Control(_)) => {
                        match control.parse_control::<Request>() {
                            Ok(Request::Resize { cols, rows, .. }) => {
                                let _ = session.resize(cols, rows);
                            }
                            Ok(_) => {
                                let reply = Response::error("only Resize is valid during attach");
                                send(tx, &reply).await?;
                            }
                            Err(e) => {
                                let _ = send(tx, &Response::error(format!("bad request: {e}"))).await;
                                return Err(LoopExit::Protocol);
                            }
                        }
                    }
                    None => return Err(LoopExit::Closed),
                }
            }
        }
    }
}

/// Stream `WatchUpdate` control frames until terminal status or the
/// collected-output cap (marker included) is reached.
async fn watch(
    session: Arc<Session>,
    include_history: bool,
    history_lines: Option<usize>,
    rx: &mut mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), LoopExit> {
    let from = if include_history {
        match history_lines {
            Some(lines) => SubscribeFrom::TailLines(lines),
            None => SubscribeFrom::Offset(session.buffer().oldest_offset()),
        }
    } else {
        SubscribeFrom::End
    };

    let mut sub = session.subscribe(from, true);
    let mut collected = 0usize;

    loop {
        tokio::select! {
            chunk = sub.rx.recv() => {
                match chunk {
                    Some(OutputChunk::Data { bytes, .. }) => {
                        let budget = WATCH_DEFAULT_MAX.saturating_sub(collected);
                        let slice = &bytes[..bytes.len().min(budget)];
                        collected += slice.len();
                        let update = Response::WatchUpdate {
                            output: String::from_utf8_lossy(slice).into_owned(),
                            done: false,
                            status: None,
                            truncated: false,
                        };
                        send(tx, &update).await?;
                        if collected >= WATCH_DEFAULT_MAX {
                            let done = Response::WatchUpdate {
                                output: String::new(),
                                done: true,
                                status: Some(session.status()),
                                truncated: true,
                            };
                            send(tx, &done).await?;
                            return Ok(());
                        }
                    }
                    Some(OutputChunk::Truncated { dropped }) => {
                        let marker = format!("[truncated {dropped} bytes]");
                        let take = marker.len().min(WATCH_DEFAULT_MAX.saturating_sub(collected));
                        collected += take;
                        let update = Response::WatchUpdate {
                            output: marker[..take].to_owned(),
                            done: false,
                            status: None,
                            truncated: false,
                        };
                        send(tx, &update).await?;
                    }
                    Some(OutputChunk::Closed { status }) => {
                        let done = Response::WatchUpdate {
                            output: String::new(),
                            done: true,
                            status: Some(status),
                            truncated: false,
                        };
                        send(tx, &done).await?;
                        return Ok(());
                    }
                    None => return Err(LoopExit::Closed),
                }
            }
            frame = rx.recv() => {
                if frame.is_none() {
                    return Err(LoopExit::Closed);
                }
                // Interleaved frames during watch are ignored.
            }
        }
    }
}

/// Forward matching session events until the client closes or the
/// optional max duration elapses.
#[allow(clippy::too_many_arguments)]
async fn subscribe(
    ctx: &HandlerContext,
    mut events_rx: tokio::sync::broadcast::Receiver<(u32, SessionEvent)>,
    session_id: Option<u32>,
    tags: Vec<String>,
    event_types: Vec<String>,
    deadline: Option<tokio::time::Instant>,
    rx: &mut mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), LoopExit> {
    // With no max duration the sleep arm never fires.
    let expiry = deadline
        .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86400 * 365));

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(expiry) => {
                // Max duration reached: end the stream, keep the connection.
                return Ok(());
            }
            event = events_rx.recv() => {
                let (id, event) = match event {
                    Ok(pair) => pair,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lost = n, "subscriber lagged, events dropped");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(LoopExit::Closed);
                    }
                };
                if !event_matches(ctx, id, &event, session_id, &tags, &event_types) {
                    continue;
                }
                send(tx, &Response::Event { session_id: id, event }).await?;
            }
            frame = rx.recv() => {
                if frame.is_none() {
                    return Err(LoopExit::Closed);
                }
            }
        }
    }
}

fn event_matches(
    ctx: &HandlerContext,
    id: u32,
    event: &SessionEvent,
    session_id: Option<u32>,
    tags: &[String],
    event_types: &[String],
) -> bool {
    if let Some(want) = session_id {
        if id != want {
            return false;
        }
    }
    if !tags.is_empty() {
        let Some(session) = ctx.manager.get(id) else {
            return false;
        };
        if !tags.iter().all(|t| session.meta.tags.contains(t)) {
            return false;
        }
    }
    if !event_types.is_empty() && !event_types.iter().any(|t| t == event.type_name()) {
        return false;
    }
    true
}

/// Pump a subscriber's output to the client as DATA frames. Ends on session
/// terminal, client close, or subscriber exhaustion.
async fn stream_output(
    sub: &mut Subscriber,
    rx: &mut mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), LoopExit> {
    loop {
        tokio::select! {
            chunk = sub.rx.recv() => {
                match chunk {
                    Some(OutputChunk::Data { bytes, .. }) => {
                        for frame in Frame::split_data(bytes) {
                            if tx.send(frame).await.is_err() {
                                return Err(LoopExit::Closed);
                            }
                        }
                    }
                    Some(OutputChunk::Truncated { dropped }) => {
                        let marker = Bytes::from(format!("[truncated {dropped} bytes]"));
                        if tx.send(Frame::Data(marker)).await.is_err() {
                            return Err(LoopExit::Closed);
                        }
                    }
                    Some(OutputChunk::Closed { .. }) | None => return Ok(()),
                }
            }
            frame = rx.recv() => {
                if frame.is_none() {
                    return Err(LoopExit::Closed);
                }
            }
        }
    }
}

fn recipient_label(session: &Session) -> String {
    session.meta.name.clone().unwrap_or_else(|| session.meta.id.to_string())
}

fn recipient_missing(recipient: &Recipient) -> String {
    match recipient {
        Recipient::Id(id) => format!("session {id} not found"),
        Recipient::Name(name) => format!("session {name:?} not found"),
    }
}

async fn send(tx: &mpsc::Sender<Frame>, response: &Response) -> Result<(), LoopExit> {
    let frame = match Frame::control(response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(err = %e, "response encode failed");
            return Err(LoopExit::Protocol);
        }
    };
    tx.send(frame).await.map_err(|_| LoopExit::Closed)
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
