// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session append-only output buffer with subscriber wakeups.
//!
//! Wraps [`OutputRing`] behind a mutex and publishes a monotonic version
//! counter through a `watch` channel. Appends never block on consumers;
//! consumers park in [`OutputBuffer::wait_for`] until new bytes land, the
//! buffer closes, or their deadline elapses.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::ring::{OutputRing, ReadFrom};

/// Outcome of [`OutputBuffer::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Bytes past the requested offset are available.
    Ready,
    /// The buffer closed (session reached terminal status) with no new bytes.
    Closed,
    /// The deadline elapsed first.
    TimedOut,
}

struct Inner {
    ring: OutputRing,
    closed: bool,
}

/// Shared append-only output log for one session.
pub struct OutputBuffer {
    inner: Mutex<Inner>,
    version_tx: watch::Sender<u64>,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner { ring: OutputRing::new(capacity), closed: false }),
            version_tx,
        }
    }

    /// Append bytes from the PTY reader. Returns the new end offset.
    ///
    /// Never blocks on consumers; wakes every waiter.
    pub fn append(&self, data: &[u8]) -> u64 {
        let end = {
            let mut inner = self.lock();
            inner.ring.append(data);
            inner.ring.end()
        };
        self.version_tx.send_modify(|v| *v += 1);
        end
    }

    /// Read everything retained from `offset`, or a truncation notice when
    /// the offset fell behind the retention window.
    pub fn read_from(&self, offset: u64) -> ReadFrom {
        self.lock().ring.read_from(offset)
    }

    /// Offset where a tail of the last `lines` lines begins.
    pub fn tail_offset(&self, lines: usize) -> u64 {
        self.lock().ring.tail_offset(lines)
    }

    /// Offset one past the newest byte (total bytes ever appended).
    pub fn end_offset(&self) -> u64 {
        self.lock().ring.end()
    }

    /// Oldest retained offset.
    pub fn oldest_offset(&self) -> u64 {
        self.lock().ring.oldest()
    }

    /// Monotonic version, bumped on every append and on close.
    pub fn version(&self) -> u64 {
        *self.version_tx.borrow()
    }

    /// Copy of the full retained window, for persistence.
    pub fn retained(&self) -> Vec<u8> {
        let inner = self.lock();
        match inner.ring.read_from(inner.ring.oldest()) {
            ReadFrom::Data(v) => v,
            ReadFrom::Truncated { .. } => Vec::new(),
        }
    }

    /// Mark the buffer closed and wake all waiters. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.version_tx.send_modify(|v| *v += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Block until bytes past `offset` exist, the buffer closes, or
    /// `timeout` elapses. Returns immediately when data is already pending.
    pub async fn wait_for(&self, offset: u64, timeout: Duration) -> WaitOutcome {
        let mut version_rx = self.version_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let inner = self.lock();
                if inner.ring.end() > offset || inner.ring.oldest() > offset {
                    return WaitOutcome::Ready;
                }
                if inner.closed {
                    return WaitOutcome::Closed;
                }
            }

            match tokio::time::timeout_at(deadline, version_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped: treat as closed.
                Ok(Err(_)) => return WaitOutcome::Closed,
                Err(_) => return WaitOutcome::TimedOut,
            }
        }
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
