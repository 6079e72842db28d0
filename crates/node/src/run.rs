// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon wiring: claim the data dir, restore sessions, start listeners
//! and the relay agent, then run until a shutdown signal.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::Context;
use ring::rand::{SecureRandom, SystemRandom};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{self, AgentConfig};
use crate::config::Settings;
use crate::handler::HandlerContext;
use crate::kv::KvStore;
use crate::manager::{Manager, ManagerConfig};
use crate::persist;
use crate::pidfile::{self, SOCK_FILE};
use crate::server::{local, ws};
use crate::session::Session;

/// Run the node daemon to completion. The returned value is the process
/// exit code.
pub async fn run(settings: Settings) -> anyhow::Result<i32> {
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("create data dir {}", settings.data_dir.display()))?;

    // Refuses with AlreadyRunning (exit code 2) when a live daemon owns
    // the dir; main maps that error.
    let pid_guard = pidfile::claim(&settings.data_dir)?;

    let auth_token = load_or_create_token(&settings)?;

    let (manager, persist_rx) = Manager::new(ManagerConfig {
        data_dir: settings.data_dir.clone(),
        buffer_capacity: settings.ring_size,
    });

    // Restore persisted sessions before accepting clients.
    let restored = persist::load_sessions(&settings.data_dir);
    if !restored.is_empty() {
        info!(count = restored.len(), "restoring persisted sessions");
    }
    for r in restored {
        let session = Session::restore(
            r.meta(),
            r.info.status.clone(),
            &r.output,
            settings.ring_size,
            manager.events_tx(),
            manager.persist_tx(),
        );
        manager.adopt_restored(session);
    }

    let shutdown = CancellationToken::new();
    let flusher = persist::spawn_flusher(Arc::clone(&manager), persist_rx, shutdown.clone());
    manager.spawn_sweeper(shutdown.clone());

    let kv = Arc::new(KvStore::open(settings.data_dir.join("kv.json"))?);
    let ctx = HandlerContext { manager, kv, shutdown: shutdown.clone() };

    local::spawn_listener(ctx.clone(), &settings.data_dir.join(SOCK_FILE))?;
    if let Some(listen) = &settings.listen {
        ws::spawn_listener(ctx.clone(), listen, auth_token.clone()).await?;
    }

    let agent_task = match (&settings.relay_url, &settings.relay_token) {
        (Some(url), Some(token)) => Some(agent::spawn(
            AgentConfig {
                relay_url: url.clone(),
                relay_token: token.clone(),
                shell: settings.shell.clone(),
            },
            shutdown.clone(),
        )),
        (Some(_), None) => {
            warn!("relay_url set without relay_token; agent disabled");
            None
        }
        _ => None,
    };

    info!(
        data_dir = %settings.data_dir.display(),
        node = settings.name.as_deref().unwrap_or("(unnamed)"),
        "node ready"
    );

    wait_for_signal().await;
    info!("shutting down");

    // Ordered shutdown: stop accepting, let readers finish, final flush,
    // then drop the pid/socket files.
    shutdown.cancel();
    if let Some(task) = agent_task {
        let _ = task.await;
    }
    let _ = flusher.await;
    drop(pid_guard);

    Ok(0)
}

/// Reuse `<data_dir>/token` or generate a fresh 256-bit token (mode 0600).
fn load_or_create_token(settings: &Settings) -> anyhow::Result<String> {
    let path = settings.data_dir.join("token");
    match std::fs::read_to_string(&path) {
        Ok(existing) => {
            let token = existing.trim().to_owned();
            if !token.is_empty() {
                return Ok(token);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    }

    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("system rng unavailable"))?;
    let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

    std::fs::write(&path, format!("{token}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod 0600 {}", path.display()))?;
    info!(path = %path.display(), "generated node auth token");
    Ok(token)
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(err = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
