// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local control socket: a Unix stream listener (mode 0600) carrying the
//! framed protocol, one handler task per connection.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CONN_DEPTH;
use crate::frame::{read_frame, write_frame, Frame};
use crate::handler::{serve, HandlerContext};
use crate::protocol::Response;

/// Bind the control socket and spawn the accept loop.
pub fn spawn_listener(ctx: HandlerContext, sock_path: &Path) -> anyhow::Result<()> {
    let listener = UnixListener::bind(sock_path)
        .with_context(|| format!("bind control socket {}", sock_path.display()))?;
    std::fs::set_permissions(sock_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod 0600 {}", sock_path.display()))?;
    info!(path = %sock_path.display(), "control socket listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(handle_connection(ctx.clone(), stream));
                        }
                        Err(e) => {
                            warn!(err = %e, "control socket accept failed");
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

/// Serve one local connection: pump frames both ways and run the handler.
async fn handle_connection(ctx: HandlerContext, stream: UnixStream) {
    let (reader, writer) = stream.into_split();
    let cancel = ctx.shutdown.child_token();

    let (in_tx, in_rx) = mpsc::channel(CONN_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(CONN_DEPTH);

    let read_task = tokio::spawn(read_pump(reader, in_tx, out_tx.clone(), cancel.clone()));
    let write_task = tokio::spawn(write_pump(writer, out_rx));

    serve(ctx, in_rx, out_tx).await;

    // The handler is done; unblock the reader and let the writer drain.
    cancel.cancel();
    let _ = read_task.await;
    let _ = write_task.await;
    debug!("local connection closed");
}

/// Socket → handler. A framing violation replies `Error` and stops.
pub(super) async fn read_pump<R>(
    mut reader: R,
    in_tx: mpsc::Sender<Frame>,
    out_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(err = %e, "framing error, closing connection");
                if let Ok(frame) = Frame::control(&Response::error(format!("protocol error: {e}")))
                {
                    let _ = out_tx.send(frame).await;
                }
                break;
            }
        }
    }
}

/// Handler → socket. Ends when every sender is gone and the queue drained.
pub(super) async fn write_pump<W>(mut writer: W, mut out_rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(err = %e, "write failed, dropping connection");
            break;
        }
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
