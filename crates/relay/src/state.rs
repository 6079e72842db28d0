// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::PendingBridge;
use crate::config::RelayConfig;
use crate::hub::Hub;
use crate::store::Store;

/// A node counts as connected if seen within this window, even without a
/// live hub registration.
pub const LIVENESS_WINDOW_MS: u64 = 2 * 60 * 1000;

/// Shared relay state.
pub struct RelayState {
    pub config: RelayConfig,
    pub hub: Hub,
    pub bridges: PendingBridge,
    pub store: Arc<dyn Store>,
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: RelayConfig, store: Arc<dyn Store>, shutdown: CancellationToken) -> Self {
        Self { config, hub: Hub::new(), bridges: PendingBridge::new(), store, shutdown }
    }

    /// Connected = live hub registration, or recent control-plane traffic.
    pub fn node_connected(&self, name: &str, last_seen_at_ms: u64, now_ms: u64) -> bool {
        if self.hub.is_connected(name) {
            return true;
        }
        now_ms.saturating_sub(last_seen_at_ms) <= LIVENESS_WINDOW_MS
    }
}

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
