// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY plumbing: spawn a child under a fresh pseudoterminal, drive the
//! master fd non-blockingly, resize, and reap.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execvp, Pid};
use tokio::io::unix::AsyncFd;

/// Default terminal geometry when the client requests none.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Read chunk size for the session reader task.
pub const READ_CHUNK: usize = 8192;

/// Newtype wrapper around `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
pub struct PtyFd(OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Master side of a spawned PTY plus the child pid.
///
/// Reads are owned by a single session reader task; writes may come from any
/// task (the kernel serializes them on the tty).
pub struct Pty {
    master: AsyncFd<PtyFd>,
    child: Pid,
}

impl Pty {
    /// Fork a child under a new PTY and exec `command` in `working_dir`.
    ///
    /// `command` must have at least one element.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(command: &[String], working_dir: &Path, cols: u16, rows: u16) -> anyhow::Result<Self> {
        if command.is_empty() {
            bail!("empty command");
        }

        let winsize =
            Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // Pre-build the exec arguments so the post-fork child only makes
        // async-signal-safe calls.
        let c_args: Vec<CString> = command
            .iter()
            .map(|s| CString::new(s.as_bytes()))
            .collect::<Result<_, _>>()
            .context("command argument contains NUL")?;

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We chdir and exec
        // immediately.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("CODEWIRE", "1");

                if chdir(working_dir).is_err() {
                    // Fall back rather than dying before exec; the caller
                    // validated the path.
                    let _ = chdir("/");
                }
                let _ = execvp(&c_args[0], &c_args);
                // Exec failed in the forked child; nothing sane to run here.
                // SAFETY: _exit is async-signal-safe and does not return.
                unsafe { libc::_exit(127) }
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let master = AsyncFd::new(PtyFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master, child })
            }
        }
    }

    pub fn child_pid(&self) -> Pid {
        self.child
    }

    /// Read one chunk from the master. `Ok(0)` means EOF; EIO also means
    /// the slave side is gone and is mapped to EOF by the caller.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| nix::unistd::read(inner, buf).map_err(io_err)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all bytes to the master.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| {
                nix::unistd::write(&inner.get_ref().0, &data[offset..]).map_err(io_err)
            }) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the terminal window size. Idempotent.
    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is fully initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send a signal to the child. Errors from an already-reaped child are
    /// reported as `Ok(false)`.
    pub fn signal(&self, sig: Signal) -> bool {
        kill(self.child, sig).is_ok()
    }

    /// Non-blocking exit probe. Returns the status when the child has
    /// exited and was reaped by this call.
    pub fn try_wait(&self) -> Option<ExitStatus> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus { code: Some(code), signal: None }),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                Some(ExitStatus { code: None, signal: Some(sig as i32) })
            }
            _ => None,
        }
    }

    /// Block until the child exits. Runs `waitpid` on a blocking thread.
    pub async fn wait_exit(&self) -> anyhow::Result<ExitStatus> {
        let pid = self.child;
        tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")?
    }
}

/// Block until the child exits and convert to our `ExitStatus`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => {
                // Reaped elsewhere (status sweep); synthesize a plain exit.
                return Ok(ExitStatus { code: Some(0), signal: None });
            }
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

/// Resolve a program name the way execvp would, without forking.
///
/// Returns `None` when the program cannot be found or is not executable.
pub fn resolve_command(program: &str) -> Option<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    fn candidate(p: std::path::PathBuf) -> Option<std::path::PathBuf> {
        let meta = std::fs::metadata(&p).ok()?;
        (meta.is_file() && meta.permissions().mode() & 0o111 != 0).then_some(p)
    }

    if program.contains('/') {
        return candidate(PathBuf::from(program));
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| candidate(dir.join(program)))
}

/// Set the given file descriptor to non-blocking mode.
fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
