// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node-local key/value store backed by a single JSON file.
//!
//! Writes go through a temp file + rename so readers never observe a
//! half-written store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

/// JSON-file key/value store.
pub struct KvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl KvStore {
    /// Open (or initialize) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse kv store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("read kv store {}", path.display())),
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn get(&self, key: &str) -> serde_json::Value {
        self.lock().get(key).cloned().unwrap_or(serde_json::Value::Null)
    }

    pub fn put(&self, key: String, value: serde_json::Value) -> anyhow::Result<()> {
        let snapshot = {
            let mut entries = self.lock();
            entries.insert(key, value);
            entries.clone()
        };
        self.flush(&snapshot)
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let (existed, snapshot) = {
            let mut entries = self.lock();
            let existed = entries.remove(key).is_some();
            (existed, entries.clone())
        };
        if existed {
            self.flush(&snapshot)?;
        }
        Ok(existed)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn flush(&self, entries: &BTreeMap<String, serde_json::Value>) -> anyhow::Result<()> {
        write_json_atomic(&self.path, entries)
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unreachable: no panics under the lock
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.entries.lock().unwrap()
    }
}

/// Serialize `value` to `path` via temp file + rename.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
#[path = "kv_tests.rs"]
mod tests;
