// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory registry from node name to its outbound message queue.
//!
//! Sends never block: a full queue or an unregistered name is an error the
//! caller surfaces (the SSH front-end reports "node not connected").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Depth of each node's outbound queue.
pub const NODE_QUEUE_DEPTH: usize = 64;

/// Messages pushed to a connected node agent, serialized as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubMessage {
    #[serde(rename = "SSHRequest")]
    SshRequest { session_id: String, cols: u16, rows: u16 },
}

/// Why a hub delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NotConnected,
    QueueFull,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => f.write_str("node not connected"),
            Self::QueueFull => f.write_str("node queue full"),
        }
    }
}

impl std::error::Error for SendError {}

struct Entry {
    epoch: u64,
    tx: mpsc::Sender<HubMessage>,
}

/// Node-name → outbound channel registry.
pub struct Hub {
    nodes: Mutex<HashMap<String, Entry>>,
    next_epoch: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self { nodes: Mutex::new(HashMap::new()), next_epoch: AtomicU64::new(1) }
    }

    /// Register a node's queue, replacing any prior registration. The epoch
    /// identifies this registration for [`Hub::unregister`].
    pub fn register(&self, name: &str) -> (u64, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(NODE_QUEUE_DEPTH);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(name.to_owned(), Entry { epoch, tx });
        (epoch, rx)
    }

    /// Remove a registration. A newer registration under the same name is
    /// left in place.
    pub fn unregister(&self, name: &str, epoch: u64) {
        let mut nodes = self.lock();
        if nodes.get(name).map(|e| e.epoch) == Some(epoch) {
            nodes.remove(name);
        }
    }

    /// Non-blocking FIFO delivery to one node.
    pub fn send(&self, name: &str, msg: HubMessage) -> Result<(), SendError> {
        let nodes = self.lock();
        let entry = nodes.get(name).ok_or(SendError::NotConnected)?;
        entry.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// Whether a node currently holds a live registration.
    pub fn is_connected(&self, name: &str) -> bool {
        self.lock().get(name).map(|e| !e.tx.is_closed()).unwrap_or(false)
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.nodes.lock().unwrap()
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
