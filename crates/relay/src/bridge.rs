// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-shot rendezvous between an SSH session and the node's back-dial.
//!
//! The SSH front-end registers an expectation keyed by bridge session id;
//! the back-connection handler delivers exactly once. Entries live only in
//! memory: a relay restart strands in-flight expectations at their timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Byte-stream halves of a delivered back connection.
pub struct BackConn {
    /// Toward the node (written into the back WebSocket).
    pub tx: mpsc::Sender<Bytes>,
    /// From the node (read off the back WebSocket).
    pub rx: mpsc::Receiver<Bytes>,
}

/// Pending-bridge table: session id → single-shot delivery slot.
pub struct PendingBridge {
    waiting: Mutex<HashMap<String, oneshot::Sender<BackConn>>>,
}

impl Default for PendingBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingBridge {
    pub fn new() -> Self {
        Self { waiting: Mutex::new(HashMap::new()) }
    }

    /// Register an expectation. A prior entry under the same id is dropped
    /// (its receiver observes a closed channel).
    pub fn expect(&self, session_id: &str) -> oneshot::Receiver<BackConn> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(session_id.to_owned(), tx);
        rx
    }

    /// Deliver the back connection to the waiter. Returns false when nobody
    /// is waiting (late dial or cancelled bridge).
    pub fn deliver(&self, session_id: &str, conn: BackConn) -> bool {
        let Some(tx) = self.lock().remove(session_id) else {
            return false;
        };
        tx.send(conn).is_ok()
    }

    /// Drop an expectation, closing the waiter's channel.
    pub fn cancel(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    /// Number of outstanding expectations.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<BackConn>>> {
        self.waiting.lock().unwrap()
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
