// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Debounced session-metadata persistence.
//!
//! Sessions signal the flusher through a bounded channel; after the first
//! signal the flusher waits 500 ms to coalesce more, then writes every
//! session's `meta.json` and `output.log` atomically. Channel close (or
//! shutdown) triggers a final flush.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kv::write_json_atomic;
use crate::manager::Manager;
use crate::protocol::{SessionInfo, Status};
use crate::session::SessionMeta;

/// Debounce window after the first persist signal.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// One restored session, ready for adoption.
pub struct RestoredSession {
    pub info: SessionInfo,
    pub output: Vec<u8>,
}

/// Spawn the debounced flusher task.
pub fn spawn_flusher(
    manager: Arc<Manager>,
    mut rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    flush_all(&manager);
                    break;
                }
                signal = rx.recv() => {
                    match signal {
                        Some(()) => {
                            tokio::time::sleep(DEBOUNCE).await;
                            // Coalesce everything that queued up meanwhile.
                            while rx.try_recv().is_ok() {}
                            flush_all(&manager);
                        }
                        None => {
                            flush_all(&manager);
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Write every session's metadata and retained output to disk.
pub fn flush_all(manager: &Manager) {
    let sessions_dir = manager.config.data_dir.join("sessions");
    for session in manager.all_sessions() {
        let dir = sessions_dir.join(session.meta.id.to_string());
        if let Err(e) = save_session(&dir, &session.info(), &session.buffer().retained()) {
            warn!(session_id = session.meta.id, err = %e, "session flush failed");
        }
    }
    debug!("session metadata flushed");
}

fn save_session(dir: &Path, info: &SessionInfo, output: &[u8]) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    write_json_atomic(&dir.join("meta.json"), info)?;

    let log = dir.join("output.log");
    let tmp = dir.join("output.log.tmp");
    std::fs::write(&tmp, output).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &log).with_context(|| format!("rename into {}", log.display()))?;
    Ok(())
}

/// Load persisted sessions from `<data_dir>/sessions/`.
///
/// Sessions that were `running` when the daemon stopped come back as
/// `failed{daemon restarted}`; their PTYs are unrecoverable.
pub fn load_sessions(data_dir: &Path) -> Vec<RestoredSession> {
    let sessions_dir = data_dir.join("sessions");
    let entries = match std::fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut restored = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        let meta_path = dir.join("meta.json");
        let info: SessionInfo = match std::fs::read(&meta_path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
        {
            Ok(info) => info,
            Err(e) => {
                warn!(path = %meta_path.display(), err = %e, "skipping unreadable session meta");
                continue;
            }
        };

        let mut info = info;
        if info.status == Status::Running {
            info.status = Status::Failed { reason: "daemon restarted".to_owned() };
        }

        let output = std::fs::read(dir.join("output.log")).unwrap_or_default();
        restored.push(RestoredSession { info, output });
    }
    restored.sort_by_key(|r| r.info.id);
    restored
}

impl RestoredSession {
    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            id: self.info.id,
            name: self.info.name.clone(),
            tags: self.info.tags.clone(),
            command: self.info.command.clone(),
            working_dir: PathBuf::from(&self.info.working_dir),
            created_at_ms: self.info.created_at_ms,
        }
    }
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
