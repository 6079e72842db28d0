// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry: id allocation, name/tag indices, lifecycle operations,
//! wait/subscribe, and the periodic exit sweep.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use anyhow::bail;
use indexmap::IndexMap;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::inbox::Inboxes;
use crate::protocol::{Recipient, SessionEvent, SessionInfo, WaitCondition};
use crate::pty::{resolve_command, DEFAULT_COLS, DEFAULT_ROWS};
use crate::session::{Session, SessionMeta};

/// Capacity of the persistence debounce channel; a full channel means a
/// flush signal is already pending.
const PERSIST_SIGNAL_DEPTH: usize = 8;
/// Event fanout depth for subscribe/wait consumers.
const EVENT_DEPTH: usize = 1024;
/// Interval of the child-exit cross-check sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[allow(clippy::unwrap_used)] // the pattern is a compile-time constant
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,32}$").unwrap());

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Launch parameters, validated by [`Manager::launch`].
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

struct Inner {
    sessions: IndexMap<u32, Arc<Session>>,
    names: HashMap<String, u32>,
    tags: HashMap<String, BTreeSet<u32>>,
}

/// Node-wide session manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub buffer_capacity: usize,
}

/// Owns every session on this node.
pub struct Manager {
    inner: RwLock<Inner>,
    next_id: AtomicU32,
    events_tx: broadcast::Sender<(u32, SessionEvent)>,
    persist_tx: mpsc::Sender<()>,
    pub inboxes: Inboxes,
    pub config: ManagerConfig,
}

impl Manager {
    /// Build the manager. The returned receiver drives the debounced
    /// persistence flusher.
    pub fn new(config: ManagerConfig) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (events_tx, _) = broadcast::channel(EVENT_DEPTH);
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_SIGNAL_DEPTH);
        let manager = Arc::new(Self {
            inner: RwLock::new(Inner {
                sessions: IndexMap::new(),
                names: HashMap::new(),
                tags: HashMap::new(),
            }),
            next_id: AtomicU32::new(1),
            events_tx,
            persist_tx,
            inboxes: Inboxes::new(),
            config,
        });
        (manager, persist_rx)
    }

    /// Validate and launch a new session. The id is returned even when the
    /// child fails to start (the session is then visible as `failed`).
    pub fn launch(self: &Arc<Self>, spec: LaunchSpec) -> anyhow::Result<u32> {
        if spec.command.is_empty() || spec.command[0].is_empty() {
            bail!("command must not be empty");
        }
        if let Some(name) = &spec.name {
            if !NAME_RE.is_match(name) {
                bail!("invalid name {name:?}: expected 1-32 chars of [A-Za-z0-9-]");
            }
        }
        for tag in &spec.tags {
            if !NAME_RE.is_match(tag) {
                bail!("invalid tag {tag:?}: expected 1-32 chars of [A-Za-z0-9-]");
            }
        }

        let working_dir = match &spec.working_dir {
            Some(dir) => {
                let path = PathBuf::from(dir);
                if !path.is_dir() {
                    bail!("working directory {dir:?} does not exist");
                }
                path
            }
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        };

        let exec_missing = resolve_command(&spec.command[0]).is_none();

        // Reserve the name and id under the write lock, then spawn outside it.
        let (id, meta) = {
            let mut inner = self.write();
            if let Some(name) = &spec.name {
                if inner.names.contains_key(name) {
                    bail!("name {name:?} is already in use");
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Some(name) = &spec.name {
                inner.names.insert(name.clone(), id);
            }
            for tag in &spec.tags {
                inner.tags.entry(tag.clone()).or_default().insert(id);
            }
            let meta = SessionMeta {
                id,
                name: spec.name.clone(),
                tags: dedup_tags(&spec.tags),
                command: spec.command.clone(),
                working_dir,
                created_at_ms: epoch_ms(),
            };
            (id, meta)
        };

        let session = if exec_missing {
            let reason = format!("exec not found: {}", spec.command[0]);
            Session::restore(
                meta.clone(),
                crate::protocol::Status::Failed { reason },
                &[],
                self.config.buffer_capacity,
                self.events_tx.clone(),
                self.persist_tx.clone(),
            )
        } else {
            Session::launch(
                meta.clone(),
                spec.cols.unwrap_or(DEFAULT_COLS),
                spec.rows.unwrap_or(DEFAULT_ROWS),
                self.config.buffer_capacity,
                self.events_tx.clone(),
                self.persist_tx.clone(),
            )
        };

        let info = session.info();
        self.write().sessions.insert(id, Arc::clone(&session));
        let _ = self.events_tx.send((id, SessionEvent::Created { info }));
        if exec_missing {
            let _ = self
                .events_tx
                .send((id, SessionEvent::Status { status: session.status() }));
        }
        let _ = self.persist_tx.try_send(());
        Ok(id)
    }

    /// Re-insert a session restored from disk. Ids continue above the
    /// restored maximum.
    pub fn adopt_restored(&self, session: Arc<Session>) {
        let id = session.meta.id;
        let mut inner = self.write();
        if let Some(name) = &session.meta.name {
            inner.names.insert(name.clone(), id);
        }
        for tag in &session.meta.tags {
            inner.tags.entry(tag.clone()).or_default().insert(id);
        }
        inner.sessions.insert(id, session);
        drop(inner);

        let floor = id.saturating_add(1);
        self.next_id.fetch_max(floor, Ordering::Relaxed);
    }

    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.read().sessions.get(&id).cloned()
    }

    /// Resolve a session by numeric id or unique name.
    pub fn resolve(&self, recipient: &Recipient) -> Option<Arc<Session>> {
        let inner = self.read();
        match recipient {
            Recipient::Id(id) => inner.sessions.get(id).cloned(),
            Recipient::Name(name) => {
                let id = inner.names.get(name)?;
                inner.sessions.get(id).cloned()
            }
        }
    }

    /// Snapshot of all sessions in launch order.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.read().sessions.values().map(|s| s.info()).collect()
    }

    /// Handles to all sessions in launch order.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.read().sessions.values().cloned().collect()
    }

    /// Kill one session. Errors distinguish unknown ids from sessions that
    /// already reached a terminal status.
    pub fn kill(&self, id: u32) -> anyhow::Result<()> {
        let session = self.get(id).ok_or_else(|| anyhow::anyhow!("session {id} not found"))?;
        if !session.kill() {
            bail!("session {id} is not running");
        }
        Ok(())
    }

    /// Kill every running session carrying all of `tags`. Returns the count.
    pub fn kill_by_tags(&self, tags: &[String]) -> usize {
        self.sessions_by_tags(tags).iter().filter(|s| s.kill()).count()
    }

    /// Sessions carrying all of the given tags.
    pub fn sessions_by_tags(&self, tags: &[String]) -> Vec<Arc<Session>> {
        if tags.is_empty() {
            return Vec::new();
        }
        let inner = self.read();
        let mut ids: Option<BTreeSet<u32>> = None;
        for tag in tags {
            let members = inner.tags.get(tag).cloned().unwrap_or_default();
            ids = Some(match ids {
                Some(acc) => acc.intersection(&members).copied().collect(),
                None => members,
            });
        }
        ids.unwrap_or_default()
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect()
    }

    /// Subscribe to the session event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<(u32, SessionEvent)> {
        self.events_tx.subscribe()
    }

    pub(crate) fn events_tx(&self) -> broadcast::Sender<(u32, SessionEvent)> {
        self.events_tx.clone()
    }

    pub(crate) fn persist_tx(&self) -> mpsc::Sender<()> {
        self.persist_tx.clone()
    }

    /// Block until the matched sessions reach terminal status, re-evaluating
    /// on every status event. Returns `(infos, timed_out)`.
    pub async fn wait(
        &self,
        id: Option<u32>,
        tags: &[String],
        condition: WaitCondition,
        timeout: Option<Duration>,
    ) -> (Vec<SessionInfo>, bool) {
        let mut events_rx = self.subscribe_events();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let matches = self.wait_matches(id, tags);
            let satisfied = match condition {
                WaitCondition::All => matches.iter().all(|s| s.is_terminal()),
                WaitCondition::Any => {
                    matches.is_empty() || matches.iter().any(|s| s.is_terminal())
                }
            };
            if satisfied {
                return (matches.iter().map(|s| s.info()).collect(), false);
            }

            let event = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, events_rx.recv()).await {
                        Ok(event) => event,
                        Err(_) => {
                            return (matches.iter().map(|s| s.info()).collect(), true);
                        }
                    }
                }
                None => events_rx.recv().await,
            };
            match event {
                Ok((_, SessionEvent::Status { .. })) | Ok((_, SessionEvent::Created { .. })) => {}
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return (matches.iter().map(|s| s.info()).collect(), true);
                }
            }
        }
    }

    fn wait_matches(&self, id: Option<u32>, tags: &[String]) -> Vec<Arc<Session>> {
        if let Some(id) = id {
            return self.get(id).into_iter().collect();
        }
        if !tags.is_empty() {
            return self.sessions_by_tags(tags);
        }
        self.read().sessions.values().cloned().collect()
    }

    /// Remove terminal sessions (all, one, or by tags) from the registry,
    /// their inboxes, and disk. Running sessions are never pruned.
    pub fn prune(&self, id: Option<u32>) -> usize {
        let victims: Vec<Arc<Session>> = match id {
            Some(id) => self.get(id).into_iter().filter(|s| s.is_terminal()).collect(),
            None => self.read().sessions.values().filter(|s| s.is_terminal()).cloned().collect(),
        };
        self.remove_sessions(&victims)
    }

    pub fn prune_by_tags(&self, tags: &[String]) -> usize {
        let victims: Vec<Arc<Session>> =
            self.sessions_by_tags(tags).into_iter().filter(|s| s.is_terminal()).collect();
        self.remove_sessions(&victims)
    }

    fn remove_sessions(&self, victims: &[Arc<Session>]) -> usize {
        if victims.is_empty() {
            return 0;
        }
        {
            let mut inner = self.write();
            for session in victims {
                let id = session.meta.id;
                inner.sessions.shift_remove(&id);
                if let Some(name) = &session.meta.name {
                    inner.names.remove(name);
                }
                for tag in &session.meta.tags {
                    if let Some(members) = inner.tags.get_mut(tag) {
                        members.remove(&id);
                        if members.is_empty() {
                            inner.tags.remove(tag);
                        }
                    }
                }
            }
        }
        for session in victims {
            self.inboxes.remove(session.meta.id);
            let dir = self.config.data_dir.join("sessions").join(session.meta.id.to_string());
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(session_id = session.meta.id, err = %e, "prune: remove dir failed");
                }
            }
        }
        let _ = self.persist_tx.try_send(());
        victims.len()
    }

    /// Kill every running session (node shutdown).
    pub fn kill_all(&self) -> usize {
        let running: Vec<Arc<Session>> =
            self.read().sessions.values().filter(|s| !s.is_terminal()).cloned().collect();
        running.iter().filter(|s| s.kill()).count()
    }

    /// Spawn the periodic sweep: child-exit cross-check plus inbox TTL.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let sessions: Vec<Arc<Session>> =
                            manager.read().sessions.values().cloned().collect();
                        for session in sessions {
                            session.check_exited();
                        }
                        manager.inboxes.sweep(epoch_ms());
                    }
                }
            }
        });
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unreachable: no panics under the lock
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap()
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unreachable: no panics under the lock
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap()
    }
}

fn dedup_tags(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tags.iter().filter(|t| seen.insert(t.as_str())).cloned().collect()
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
