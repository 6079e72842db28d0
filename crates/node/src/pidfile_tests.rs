// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn claim_writes_and_drop_removes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pid_path = dir.path().join(PID_FILE);

    {
        let _guard = claim(dir.path())?;
        let contents = std::fs::read_to_string(&pid_path)?;
        assert_eq!(contents.trim().parse::<u32>().ok(), Some(std::process::id()));
    }
    assert!(!pid_path.exists());
    Ok(())
}

#[test]
fn live_pid_refuses_claim() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // Our own PID is definitely alive.
    std::fs::write(dir.path().join(PID_FILE), format!("{}\n", std::process::id()))?;

    let err = match claim(dir.path()) {
        Err(e) => e,
        Ok(_) => anyhow::bail!("claim should have failed"),
    };
    assert!(err.downcast_ref::<AlreadyRunning>().is_some());
    Ok(())
}

#[test]
fn stale_pid_and_socket_are_cleaned() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // PID 1 is never ours to signal from a test; a huge PID is simply gone.
    std::fs::write(dir.path().join(PID_FILE), "999999999\n")?;
    std::fs::write(dir.path().join(SOCK_FILE), "")?;

    let _guard = claim(dir.path())?;
    let contents = std::fs::read_to_string(dir.path().join(PID_FILE))?;
    assert_eq!(contents.trim().parse::<u32>().ok(), Some(std::process::id()));
    Ok(())
}
