// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Configuration for the codewire relay.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "codewire-relay", version, about)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "CODEWIRE_RELAY_HOST")]
    pub host: String,

    /// HTTP/WebSocket port.
    #[arg(long, default_value_t = 9900, env = "CODEWIRE_RELAY_PORT")]
    pub port: u16,

    /// SSH front-end port.
    #[arg(long, default_value_t = 2222, env = "CODEWIRE_RELAY_SSH_PORT")]
    pub ssh_port: u16,

    /// Bearer token for the admin API.
    #[arg(long, env = "CODEWIRE_RELAY_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Path to the relay store.
    #[arg(long, default_value = "relay.db", env = "CODEWIRE_RELAY_DB")]
    pub db_path: std::path::PathBuf,

    /// Seconds an SSH session waits for the node's back-dial.
    #[arg(long, default_value_t = 10, env = "CODEWIRE_RELAY_BRIDGE_TIMEOUT")]
    pub bridge_timeout_s: u64,
}

impl RelayConfig {
    pub fn bridge_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.bridge_timeout_s)
    }
}
