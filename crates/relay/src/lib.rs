// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Codewire relay: node registry, SSH front-end, and the pending-bridge
//! plane pairing SSH sessions with node back-dials.

pub mod bridge;
pub mod config;
pub mod error;
pub mod hub;
pub mod ssh;
pub mod state;
pub mod store;
pub mod transport;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::state::RelayState;
use crate::store::FileStore;
use crate::transport::build_router;

/// Run the relay until shutdown.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let store = Arc::new(FileStore::open(&config.db_path)?);
    let state = Arc::new(RelayState::new(config, store, shutdown.clone()));

    let ssh_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = ssh::run_ssh(ssh_state).await {
            error!("ssh front-end failed: {e:#}");
        }
    });

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("bind {addr}"))?;
    info!(addr, "relay listening");

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        signal_shutdown.cancel();
    });

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
