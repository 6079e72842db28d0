// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One PTY-backed session: child process, output buffer, status machine,
//! and output subscribers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::Signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::buffer::{OutputBuffer, WaitOutcome};
use crate::protocol::{SessionEvent, SessionInfo, Status};
use crate::pty::{Pty, READ_CHUNK};
use crate::ring::ReadFrom;

/// Grace period between SIGHUP and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Subscriber channel depth.
const SUBSCRIBER_DEPTH: usize = 64;

/// Chunk delivered to an output subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Output bytes; `end_offset` is the cursor after this chunk.
    Data { bytes: Bytes, end_offset: u64 },
    /// The subscriber lagged past retention; `dropped` bytes are gone.
    Truncated { dropped: u64 },
    /// The session reached a terminal status and the stream is drained.
    Closed { status: Status },
}

/// Where a new subscriber starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFrom {
    Offset(u64),
    TailLines(usize),
    /// Live output only, no history.
    End,
}

/// Handle to a session output stream.
pub struct Subscriber {
    pub rx: mpsc::Receiver<OutputChunk>,
}

/// Immutable launch-time metadata.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: u32,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub created_at_ms: u64,
}

/// A running or finished session.
pub struct Session {
    pub meta: SessionMeta,
    status: Mutex<Status>,
    buffer: Arc<OutputBuffer>,
    pty: Option<Arc<Pty>>,
    /// Session-scoped events, tagged with the id by the manager fanout.
    events_tx: broadcast::Sender<(u32, SessionEvent)>,
    persist_tx: mpsc::Sender<()>,
}

impl Session {
    /// Spawn the child and start the reader task.
    ///
    /// A PTY or exec failure still yields a session (visible as `failed`),
    /// matching the launch contract: the id is always returned.
    pub fn launch(
        meta: SessionMeta,
        cols: u16,
        rows: u16,
        buffer_capacity: usize,
        events_tx: broadcast::Sender<(u32, SessionEvent)>,
        persist_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let buffer = Arc::new(OutputBuffer::new(buffer_capacity));

        match Pty::spawn(&meta.command, &meta.working_dir, cols, rows) {
            Ok(pty) => {
                let pty = Arc::new(pty);
                let session = Arc::new(Self {
                    meta,
                    status: Mutex::new(Status::Running),
                    buffer,
                    pty: Some(Arc::clone(&pty)),
                    events_tx,
                    persist_tx,
                });
                tokio::spawn(Arc::clone(&session).read_loop(pty));
                session
            }
            Err(e) => {
                warn!(session_id = meta.id, err = %e, "pty spawn failed");
                buffer.close();
                let session = Arc::new(Self {
                    meta,
                    status: Mutex::new(Status::Failed { reason: e.to_string() }),
                    buffer,
                    pty: None,
                    events_tx,
                    persist_tx,
                });
                session.emit_status();
                session.signal_persist();
                session
            }
        }
    }

    /// Rebuild a persisted session after a daemon restart. No PTY; history
    /// is served from the restored buffer.
    pub fn restore(
        meta: SessionMeta,
        status: Status,
        output: &[u8],
        buffer_capacity: usize,
        events_tx: broadcast::Sender<(u32, SessionEvent)>,
        persist_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let buffer = Arc::new(OutputBuffer::new(buffer_capacity));
        buffer.append(output);
        buffer.close();
        Arc::new(Self {
            meta,
            status: Mutex::new(status),
            buffer,
            pty: None,
            events_tx,
            persist_tx,
        })
    }

    pub fn status(&self) -> Status {
        self.lock_status().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock_status().is_terminal()
    }

    pub fn buffer(&self) -> &Arc<OutputBuffer> {
        &self.buffer
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.meta.id,
            name: self.meta.name.clone(),
            tags: self.meta.tags.clone(),
            command: self.meta.command.clone(),
            working_dir: self.meta.working_dir.display().to_string(),
            status: self.status(),
            created_at_ms: self.meta.created_at_ms,
        }
    }

    /// Write bytes to the child's stdin. Fails once the session is terminal.
    pub async fn send_input(&self, data: &[u8]) -> anyhow::Result<usize> {
        if self.is_terminal() {
            anyhow::bail!("session {} is not running", self.meta.id);
        }
        let pty = self.pty.as_ref().ok_or_else(|| anyhow::anyhow!("session has no pty"))?;
        pty.write_all(data).await?;
        Ok(data.len())
    }

    /// Set the PTY window size. Idempotent; a terminal session is an error.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        if self.is_terminal() {
            anyhow::bail!("session {} is not running", self.meta.id);
        }
        let pty = self.pty.as_ref().ok_or_else(|| anyhow::anyhow!("session has no pty"))?;
        pty.resize(cols, rows)
    }

    /// SIGHUP now, SIGKILL after the grace period. Returns true iff the
    /// session was running and has transitioned to `killed`.
    pub fn kill(self: &Arc<Self>) -> bool {
        let Some(pty) = self.pty.clone() else {
            return false;
        };
        if !self.transition(Status::Killed) {
            return false;
        }
        pty.signal(Signal::SIGHUP);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            if pty.try_wait().is_none() {
                debug!(session_id = session.meta.id, "grace elapsed, sending SIGKILL");
                pty.signal(Signal::SIGKILL);
            }
        });
        true
    }

    /// Cross-check for a child that exited without the reader observing
    /// EOF yet (periodic sweep).
    pub fn check_exited(&self) {
        if self.is_terminal() {
            return;
        }
        let Some(pty) = self.pty.as_ref() else { return };
        if let Some(exit) = pty.try_wait() {
            let status = exit_to_status(exit);
            if self.transition(status) {
                self.buffer.close();
                self.emit_status();
                self.signal_persist();
            }
        }
    }

    /// Register an output subscriber.
    ///
    /// The returned channel yields history (per `from`), any truncation
    /// notices, then live chunks, and finally `Closed` when the session is
    /// terminal and drained. With `live = false` the stream ends once it
    /// has caught up.
    pub fn subscribe(self: &Arc<Self>, from: SubscribeFrom, live: bool) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        let session = Arc::clone(self);
        tokio::spawn(async move { session.pump_subscriber(from, live, tx).await });
        Subscriber { rx }
    }

    async fn pump_subscriber(
        self: Arc<Self>,
        from: SubscribeFrom,
        live: bool,
        tx: mpsc::Sender<OutputChunk>,
    ) {
        let mut cursor = match from {
            SubscribeFrom::Offset(offset) => offset,
            SubscribeFrom::TailLines(lines) => self.buffer.tail_offset(lines),
            SubscribeFrom::End => self.buffer.end_offset(),
        };

        loop {
            match self.buffer.read_from(cursor) {
                ReadFrom::Truncated { start, dropped } => {
                    if tx.send(OutputChunk::Truncated { dropped }).await.is_err() {
                        return;
                    }
                    cursor = start;
                }
                ReadFrom::Data(bytes) if !bytes.is_empty() => {
                    cursor += bytes.len() as u64;
                    let chunk =
                        OutputChunk::Data { bytes: Bytes::from(bytes), end_offset: cursor };
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                ReadFrom::Data(_) => {
                    if !live {
                        return;
                    }
                    match self.buffer.wait_for(cursor, Duration::from_secs(3600)).await {
                        WaitOutcome::Ready => continue,
                        WaitOutcome::Closed => {
                            let _ = tx.send(OutputChunk::Closed { status: self.status() }).await;
                            return;
                        }
                        WaitOutcome::TimedOut => continue,
                    }
                }
            }
        }
    }

    /// Reader task: master → output buffer until EOF/EIO, then reap, set
    /// terminal status, wake subscribers, nudge persistence.
    async fn read_loop(self: Arc<Self>, pty: Arc<Pty>) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match pty.read_chunk(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let end = self.buffer.append(&buf[..n]);
                    let _ = self.events_tx.send((
                        self.meta.id,
                        SessionEvent::OutputChunkMeta { offset: end - n as u64, len: n },
                    ));
                }
                // EIO: slave side closed, treated as EOF.
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Err(e) => {
                    warn!(session_id = self.meta.id, err = %e, "pty read failed");
                    break;
                }
            }
        }

        let status = match pty.wait_exit().await {
            Ok(exit) => exit_to_status(exit),
            Err(e) => Status::Failed { reason: format!("wait failed: {e}") },
        };
        self.transition(status);
        self.buffer.close();
        // Status events always trail the session's final output chunk.
        self.emit_status();
        self.signal_persist();
    }

    /// Move `running` to a terminal state, exactly once.
    fn transition(&self, status: Status) -> bool {
        let mut guard = self.lock_status();
        if guard.is_terminal() {
            return false;
        }
        *guard = status;
        true
    }

    fn emit_status(&self) {
        let _ = self.events_tx.send((self.meta.id, SessionEvent::Status { status: self.status() }));
    }

    /// Nudge the debounced persister. A full channel means a flush is
    /// already pending.
    fn signal_persist(&self) {
        let _ = self.persist_tx.try_send(());
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock_status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap()
    }
}

fn exit_to_status(exit: crate::pty::ExitStatus) -> Status {
    match (exit.code, exit.signal) {
        (Some(code), _) => Status::Completed { exit_code: code },
        (None, Some(sig)) => Status::Completed { exit_code: 128 + sig },
        (None, None) => Status::Failed { reason: "unknown exit".to_owned() },
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
