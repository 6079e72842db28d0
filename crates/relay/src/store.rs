// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay persistence behind a narrow trait: node records, bridge audit
//! entries, device flows, and invites. The shipping implementation is a
//! single JSON file (`relay.db`) written atomically; callers only see the
//! contracts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A registered node and its auth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_identity: Option<String>,
    pub authorized_at_ms: u64,
    #[serde(default)]
    pub last_seen_at_ms: u64,
}

/// Audit record for one SSH bridge attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub session_id: String,
    pub node: String,
    pub started_at_ms: u64,
    pub connected: bool,
}

/// An in-flight device authorization flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFlow {
    pub code: String,
    pub node_name: String,
    pub created_at_ms: u64,
}

/// A single-use registration invite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub code: String,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Persistence contracts the relay depends on.
pub trait Store: Send + Sync {
    /// Insert a node; an existing name is an error.
    fn create_node(&self, record: NodeRecord) -> anyhow::Result<()>;
    fn get_node(&self, name: &str) -> anyhow::Result<Option<NodeRecord>>;
    fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>>;
    /// Remove a node; returns whether it existed.
    fn delete_node(&self, name: &str) -> anyhow::Result<bool>;
    /// Update `last_seen_at_ms` for a connected node.
    fn touch_node(&self, name: &str, now_ms: u64) -> anyhow::Result<()>;

    /// Append a bridge audit record.
    fn record_bridge(&self, record: BridgeRecord) -> anyhow::Result<()>;

    /// Store a device flow keyed by code, replacing any prior flow.
    fn put_device_flow(&self, flow: DeviceFlow) -> anyhow::Result<()>;
    /// Remove and return the flow for a code.
    fn take_device_flow(&self, code: &str) -> anyhow::Result<Option<DeviceFlow>>;

    /// Store an invite keyed by code.
    fn put_invite(&self, invite: Invite) -> anyhow::Result<()>;
    /// Remove and return the invite for a code (single use).
    fn take_invite(&self, code: &str) -> anyhow::Result<Option<Invite>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    nodes: HashMap<String, NodeRecord>,
    #[serde(default)]
    bridges: Vec<BridgeRecord>,
    #[serde(default)]
    device_flows: HashMap<String, DeviceFlow>,
    #[serde(default)]
    invites: HashMap<String, Invite>,
}

/// Retained bridge audit entries; older ones roll off.
const BRIDGE_AUDIT_CAP: usize = 1024;

/// JSON-file store.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e).with_context(|| format!("open store {}", path.display())),
        };
        Ok(Self { path, data: Mutex::new(data) })
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StoreData) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let mut data = self.lock();
        let result = f(&mut data)?;
        let json = serde_json::to_vec_pretty(&*data)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(result)
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock(&self) -> std::sync::MutexGuard<'_, StoreData> {
        self.data.lock().unwrap()
    }
}

impl Store for FileStore {
    fn create_node(&self, record: NodeRecord) -> anyhow::Result<()> {
        self.mutate(|data| {
            if data.nodes.contains_key(&record.name) {
                anyhow::bail!("node {:?} already exists", record.name);
            }
            data.nodes.insert(record.name.clone(), record);
            Ok(())
        })
    }

    fn get_node(&self, name: &str) -> anyhow::Result<Option<NodeRecord>> {
        Ok(self.lock().nodes.get(name).cloned())
    }

    fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let mut nodes: Vec<NodeRecord> = self.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    fn delete_node(&self, name: &str) -> anyhow::Result<bool> {
        self.mutate(|data| Ok(data.nodes.remove(name).is_some()))
    }

    fn touch_node(&self, name: &str, now_ms: u64) -> anyhow::Result<()> {
        self.mutate(|data| {
            if let Some(node) = data.nodes.get_mut(name) {
                node.last_seen_at_ms = now_ms;
            }
            Ok(())
        })
    }

    fn record_bridge(&self, record: BridgeRecord) -> anyhow::Result<()> {
        self.mutate(|data| {
            data.bridges.push(record);
            if data.bridges.len() > BRIDGE_AUDIT_CAP {
                let excess = data.bridges.len() - BRIDGE_AUDIT_CAP;
                data.bridges.drain(..excess);
            }
            Ok(())
        })
    }

    fn put_device_flow(&self, flow: DeviceFlow) -> anyhow::Result<()> {
        self.mutate(|data| {
            data.device_flows.insert(flow.code.clone(), flow);
            Ok(())
        })
    }

    fn take_device_flow(&self, code: &str) -> anyhow::Result<Option<DeviceFlow>> {
        self.mutate(|data| Ok(data.device_flows.remove(code)))
    }

    fn put_invite(&self, invite: Invite) -> anyhow::Result<()> {
        self.mutate(|data| {
            data.invites.insert(invite.code.clone(), invite);
            Ok(())
        })
    }

    fn take_invite(&self, code: &str) -> anyhow::Result<Option<Invite>> {
        self.mutate(|data| Ok(data.invites.remove(code)))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
