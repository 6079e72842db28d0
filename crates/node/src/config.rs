// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node configuration: CLI flags merged over `<data_dir>/config.toml`.
//! Flags and environment variables win over the file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

/// Remote-terminal node daemon.
#[derive(Debug, Parser)]
#[command(name = "codewire", version, about)]
pub struct Config {
    /// Data directory for state, socket, PID and token files.
    #[arg(long, env = "CODEWIRE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Node name announced to the relay.
    #[arg(long, env = "CODEWIRE_NODE_NAME")]
    pub name: Option<String>,

    /// Optional WebSocket bind address (e.g. 127.0.0.1:9800).
    #[arg(long, env = "CODEWIRE_LISTEN")]
    pub listen: Option<String>,

    /// Relay base URL; enables the relay agent.
    #[arg(long, env = "CODEWIRE_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Node token for relay authentication.
    #[arg(long, env = "CODEWIRE_RELAY_TOKEN")]
    pub relay_token: Option<String>,

    /// Per-session output retention in bytes.
    #[arg(long, env = "CODEWIRE_RING_SIZE", default_value_t = 1048576)]
    pub ring_size: usize,

    /// Shell spawned for relay bridges.
    #[arg(long, env = "CODEWIRE_SHELL", default_value = "bash")]
    pub shell: String,

    /// Log format (json or text).
    #[arg(long, env = "CODEWIRE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CODEWIRE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// `<data_dir>/config.toml` contents.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub relay_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub listen: Option<String>,
}

/// Fully-resolved node settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub name: Option<String>,
    pub listen: Option<String>,
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub ring_size: usize,
    pub shell: String,
}

impl Config {
    /// Merge flags over the config file and resolve defaults.
    pub fn resolve(self) -> anyhow::Result<Settings> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => default_data_dir(),
        };

        let file = load_file_config(&data_dir)?;

        Ok(Settings {
            name: self.name.or(file.node.name),
            listen: self.listen.or(file.node.listen),
            relay_url: self.relay_url.or(file.relay_url),
            relay_token: self.relay_token.or(file.relay_token),
            ring_size: self.ring_size,
            shell: self.shell,
            data_dir,
        })
    }
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".codewire"),
        None => PathBuf::from(".codewire"),
    }
}

fn load_file_config(data_dir: &std::path::Path) -> anyhow::Result<FileConfig> {
    let path = data_dir.join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
