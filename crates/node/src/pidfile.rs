// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Data-dir ownership: PID file liveness and stale runtime-file cleanup.

use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

pub const PID_FILE: &str = "codewire.pid";
pub const SOCK_FILE: &str = "codewire.sock";

/// Why the data dir could not be claimed.
#[derive(Debug)]
pub struct AlreadyRunning {
    pub pid: i32,
}

impl std::fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another daemon (pid {}) owns this data dir", self.pid)
    }
}

impl std::error::Error for AlreadyRunning {}

/// RAII guard over the PID file; removes it (and the socket) on drop.
pub struct PidGuard {
    pid_path: PathBuf,
    sock_path: PathBuf,
}

/// Claim the data dir.
///
/// A live PID in `codewire.pid` refuses the claim ([`AlreadyRunning`], exit
/// code 2). Stale PID and socket files are removed only after the liveness
/// probe fails.
pub fn claim(data_dir: &Path) -> anyhow::Result<PidGuard> {
    let pid_path = data_dir.join(PID_FILE);
    let sock_path = data_dir.join(SOCK_FILE);

    if let Ok(contents) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = contents.trim().parse::<i32>() {
            if process_alive(pid) {
                return Err(AlreadyRunning { pid }.into());
            }
            info!(stale_pid = pid, "removing stale runtime files");
        }
        let _ = std::fs::remove_file(&pid_path);
    }
    if sock_path.exists() {
        let _ = std::fs::remove_file(&sock_path);
    }

    let pid = std::process::id();
    std::fs::write(&pid_path, format!("{pid}\n"))
        .with_context(|| format!("write {}", pid_path.display()))?;

    Ok(PidGuard { pid_path, sock_path })
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes existence without delivering anything. EPERM still
    // means the process exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.pid_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(err = %e, "failed to remove pid file");
            }
        }
        let _ = std::fs::remove_file(&self.sock_path);
    }
}

#[cfg(test)]
#[path = "pidfile_tests.rs"]
mod tests;
