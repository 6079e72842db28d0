// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session direct-message inboxes with request/reply rendezvous.
//!
//! Plain messages are retained until a `MsgRead` returns them once.
//! `request` entries survive until replied (or a TTL sweep); a reply that
//! finds no live waiter replaces its request as an orphaned reply, returned
//! and deleted on the next read.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::{InboxMessage, MessageKind};

/// Per-inbox entry cap; the oldest entries are dropped first.
const INBOX_CAP: usize = 256;
/// Unreplied requests older than this are swept.
const REQUEST_TTL: Duration = Duration::from_secs(600);

struct Inner {
    boxes: HashMap<u32, VecDeque<InboxMessage>>,
    /// request_id → waiter for the handler blocked in `MsgRequest`.
    waiters: HashMap<String, oneshot::Sender<InboxMessage>>,
}

/// All inboxes on this node.
pub struct Inboxes {
    inner: Mutex<Inner>,
}

impl Default for Inboxes {
    fn default() -> Self {
        Self::new()
    }
}

impl Inboxes {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { boxes: HashMap::new(), waiters: HashMap::new() }),
        }
    }

    /// Append a plain message to `to_id`'s inbox. Returns the message id.
    pub fn send(
        &self,
        to_id: u32,
        to_label: String,
        from: Option<String>,
        body: String,
        now_ms: u64,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let msg = InboxMessage {
            id: id.clone(),
            from,
            to: to_label,
            body,
            kind: MessageKind::Message,
            request_id: None,
            created_at_ms: now_ms,
        };
        self.push(to_id, msg);
        id
    }

    /// Append a `request` entry and register a one-shot waiter for its reply.
    pub fn request(
        &self,
        to_id: u32,
        to_label: String,
        from: Option<String>,
        body: String,
        now_ms: u64,
    ) -> (String, oneshot::Receiver<InboxMessage>) {
        let request_id = Uuid::new_v4().to_string();
        let msg = InboxMessage {
            id: Uuid::new_v4().to_string(),
            from,
            to: to_label,
            body,
            kind: MessageKind::Request,
            request_id: Some(request_id.clone()),
            created_at_ms: now_ms,
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            inner.waiters.insert(request_id.clone(), tx);
        }
        self.push(to_id, msg);
        (request_id, rx)
    }

    /// Deliver a reply. Resolves the pending waiter when one is registered;
    /// otherwise stores an orphaned reply in place of the request entry.
    /// Returns whether a waiter was resolved.
    pub fn reply(&self, request_id: &str, body: String, from: Option<String>, now_ms: u64) -> bool {
        let reply = InboxMessage {
            id: Uuid::new_v4().to_string(),
            from,
            to: String::new(),
            body,
            kind: MessageKind::Reply,
            request_id: Some(request_id.to_owned()),
            created_at_ms: now_ms,
        };

        let mut inner = self.lock();

        // The request entry is resolved either way.
        let mut home: Option<u32> = None;
        for (id, entries) in inner.boxes.iter_mut() {
            let before = entries.len();
            entries.retain(|m| {
                !(m.kind == MessageKind::Request && m.request_id.as_deref() == Some(request_id))
            });
            if entries.len() != before {
                home = Some(*id);
            }
        }

        let reply = match inner.waiters.remove(request_id) {
            Some(tx) => match tx.send(reply) {
                Ok(()) => return true,
                // Waiter vanished between lookup and send; orphan instead.
                Err(returned) => returned,
            },
            None => reply,
        };

        let mut orphan = reply;
        if let Some(home) = home {
            orphan.to = home.to_string();
            let entries = inner.boxes.entry(home).or_default();
            entries.push_back(orphan);
            while entries.len() > INBOX_CAP {
                entries.pop_front();
            }
        }
        false
    }

    /// Drop the waiter for a timed-out request; the entry stays so a late
    /// reply lands as an orphan.
    pub fn cancel_waiter(&self, request_id: &str) {
        self.lock().waiters.remove(request_id);
    }

    /// Return up to `limit` entries, unresolved requests first, newest last
    /// within each group. Returned plain messages and orphaned replies are
    /// deleted; requests stay until replied.
    pub fn read(&self, session_id: u32, limit: usize) -> Vec<InboxMessage> {
        let mut inner = self.lock();
        let Some(entries) = inner.boxes.get_mut(&session_id) else {
            return Vec::new();
        };

        let mut requests: Vec<InboxMessage> = Vec::new();
        let mut others: Vec<InboxMessage> = Vec::new();
        for msg in entries.iter() {
            match msg.kind {
                MessageKind::Request => requests.push(msg.clone()),
                _ => others.push(msg.clone()),
            }
        }

        // Newest entries win the limit; unresolved requests go on top.
        let keep = requests.len().min(limit);
        let mut out: Vec<InboxMessage> =
            requests[requests.len() - keep..].to_vec();
        let room = limit - out.len();
        let keep = others.len().min(room);
        out.extend_from_slice(&others[others.len() - keep..]);

        let returned: Vec<String> = out.iter().map(|m| m.id.clone()).collect();
        entries.retain(|m| m.kind == MessageKind::Request || !returned.contains(&m.id));
        if entries.is_empty() {
            inner.boxes.remove(&session_id);
        }
        out
    }

    /// Drop a pruned session's inbox.
    pub fn remove(&self, session_id: u32) {
        self.lock().boxes.remove(&session_id);
    }

    /// TTL sweep: discard requests (and their waiters) older than the cap.
    pub fn sweep(&self, now_ms: u64) {
        let ttl_ms = REQUEST_TTL.as_millis() as u64;
        let mut inner = self.lock();
        let mut stale: Vec<String> = Vec::new();
        for entries in inner.boxes.values_mut() {
            entries.retain(|m| {
                let expired = m.kind == MessageKind::Request
                    && now_ms.saturating_sub(m.created_at_ms) > ttl_ms;
                if expired {
                    if let Some(rid) = &m.request_id {
                        stale.push(rid.clone());
                    }
                }
                !expired
            });
        }
        inner.boxes.retain(|_, entries| !entries.is_empty());
        for rid in stale {
            inner.waiters.remove(&rid);
        }
    }

    fn push(&self, to_id: u32, msg: InboxMessage) {
        let mut inner = self.lock();
        let entries = inner.boxes.entry(to_id).or_default();
        entries.push_back(msg);
        while entries.len() > INBOX_CAP {
            entries.pop_front();
        }
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

#[cfg(test)]
#[path = "inbox_tests.rs"]
mod tests;
