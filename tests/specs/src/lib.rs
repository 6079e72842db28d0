// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `codewire` and `codewire-relay` binaries as subprocesses
//! and exercises them over the Unix control socket, the authenticated
//! WebSocket, the relay admin API, and SSH.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

use anyhow::Context;
use codewire::frame::{read_frame, write_frame, Frame};
use codewire::protocol::{Request, Response};
use tokio::net::UnixStream;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to a compiled workspace binary.
fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

pub fn node_binary() -> PathBuf {
    workspace_binary("codewire")
}

pub fn relay_binary() -> PathBuf {
    workspace_binary("codewire-relay")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A framed client connection to a node's control socket.
pub struct ControlConn {
    stream: UnixStream,
}

impl ControlConn {
    pub async fn connect(sock: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(sock).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        write_frame(&mut self.stream, &Frame::control(request)?).await
    }

    pub async fn send_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.stream, &Frame::Data(bytes::Bytes::copy_from_slice(data))).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<Option<Frame>> {
        tokio::time::timeout(Duration::from_secs(15), read_frame(&mut self.stream))
            .await
            .context("frame receive timed out")?
    }

    /// Receive the next CONTROL frame, skipping interleaved DATA frames.
    pub async fn recv_response(&mut self) -> anyhow::Result<Response> {
        loop {
            let frame =
                self.recv().await?.ok_or_else(|| anyhow::anyhow!("connection closed"))?;
            if matches!(frame, Frame::Control(_)) {
                return Ok(frame.parse_control()?);
            }
        }
    }

    pub async fn request(&mut self, request: &Request) -> anyhow::Result<Response> {
        self.send(request).await?;
        self.recv_response().await
    }
}

/// A running `codewire` daemon, killed on drop.
pub struct NodeProcess {
    child: Option<Child>,
    pub data_dir: PathBuf,
    _owned_dir: Option<tempfile::TempDir>,
    pub ws_port: Option<u16>,
}

/// Extra daemon wiring for a [`NodeProcess`].
#[derive(Default)]
pub struct NodeOptions {
    pub ws: bool,
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub name: Option<String>,
}

impl NodeProcess {
    /// Start a daemon in a fresh temp data dir.
    pub async fn start() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::start_in(dir.path().to_path_buf(), Some(dir), NodeOptions::default()).await
    }

    /// Start a daemon reusing an existing data dir (restart scenarios).
    pub async fn start_with_dir(data_dir: PathBuf) -> anyhow::Result<Self> {
        Self::start_in(data_dir, None, NodeOptions::default()).await
    }

    pub async fn start_with_options(options: NodeOptions) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::start_in(dir.path().to_path_buf(), Some(dir), options).await
    }

    async fn start_in(
        data_dir: PathBuf,
        owned_dir: Option<tempfile::TempDir>,
        options: NodeOptions,
    ) -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = node_binary();
        anyhow::ensure!(binary.exists(), "codewire binary not found at {}", binary.display());

        let mut args: Vec<String> =
            vec!["--data-dir".into(), data_dir.to_string_lossy().into_owned()];
        let ws_port = if options.ws {
            let port = free_port()?;
            args.extend(["--listen".into(), format!("127.0.0.1:{port}")]);
            Some(port)
        } else {
            None
        };
        if let Some(url) = &options.relay_url {
            args.extend(["--relay-url".into(), url.clone()]);
        }
        if let Some(token) = &options.relay_token {
            args.extend(["--relay-token".into(), token.clone()]);
        }
        if let Some(name) = &options.name {
            args.extend(["--name".into(), name.clone()]);
        }

        let child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {}", binary.display()))?;

        let node =
            Self { child: Some(child), data_dir, _owned_dir: owned_dir, ws_port };
        node.wait_ready(Duration::from_secs(10)).await?;
        Ok(node)
    }

    pub fn sock_path(&self) -> PathBuf {
        self.data_dir.join("codewire.sock")
    }

    /// The node's on-disk auth token.
    pub fn auth_token(&self) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(self.data_dir.join("token"))?.trim().to_owned())
    }

    /// Poll the control socket until the daemon accepts connections.
    pub async fn wait_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let sock = self.sock_path();
        loop {
            if UnixStream::connect(&sock).await.is_ok() {
                return Ok(());
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "daemon never opened {}",
                sock.display()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn control(&self) -> anyhow::Result<ControlConn> {
        ControlConn::connect(&self.sock_path()).await
    }

    /// Graceful SIGTERM shutdown, waiting for exit.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.take() else { return Ok(()) };
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("daemon ignored SIGTERM");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A running `codewire-relay`, killed on drop.
pub struct RelayProcess {
    child: Option<Child>,
    pub port: u16,
    pub ssh_port: u16,
    pub admin_token: String,
    _dir: tempfile::TempDir,
}

impl RelayProcess {
    pub async fn start() -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = relay_binary();
        anyhow::ensure!(binary.exists(), "relay binary not found at {}", binary.display());

        let dir = tempfile::tempdir()?;
        let port = free_port()?;
        let ssh_port = free_port()?;
        let admin_token = "smoke-admin-token".to_owned();

        let child = Command::new(&binary)
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--ssh-port",
                &ssh_port.to_string(),
                "--admin-token",
                &admin_token,
                "--db-path",
                &dir.path().join("relay.db").to_string_lossy(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {}", binary.display()))?;

        let relay = Self { child: Some(child), port, ssh_port, admin_token, _dir: dir };
        relay.wait_healthy(Duration::from_secs(10)).await?;
        Ok(relay)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let url = format!("{}/healthz", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = reqwest::get(&url).await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            anyhow::ensure!(tokio::time::Instant::now() < deadline, "relay never became healthy");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Register a node through the admin API, returning its token.
    pub async fn create_node(&self, name: &str) -> anyhow::Result<String> {
        let client = reqwest::Client::new();
        let resp: serde_json::Value = client
            .post(format!("{}/api/v1/nodes", self.base_url()))
            .bearer_auth(&self.admin_token)
            .json(&serde_json::json!({ "node_name": name }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        resp["node_token"]
            .as_str()
            .map(|s| s.to_owned())
            .ok_or_else(|| anyhow::anyhow!("missing node_token in {resp}"))
    }

    /// Poll the admin API until the named node reports connected.
    pub async fn wait_node_connected(&self, name: &str, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/nodes", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let nodes: serde_json::Value = client
                .get(&url)
                .bearer_auth(&self.admin_token)
                .send()
                .await?
                .json()
                .await?;
            let connected = nodes
                .as_array()
                .into_iter()
                .flatten()
                .any(|n| n["name"] == name && n["connected"] == true);
            if connected {
                return Ok(());
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "node {name} never connected: {nodes}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
