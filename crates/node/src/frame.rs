// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed frame codec shared by the local socket and WebSocket
//! transports.
//!
//! Wire layout: a 5-byte header (one `kind` byte, CONTROL=1 or DATA=2, then
//! a big-endian u32 payload length) followed by the payload. CONTROL payloads
//! are UTF-8 JSON capped at 1 MiB; DATA payloads are opaque bytes capped at
//! 256 KiB (senders split larger chunks). Oversized or unknown frames are
//! protocol errors and must close the connection.
//!
//! Over WebSockets the same layout is carried one-frame-per-binary-message.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum CONTROL payload size in bytes.
pub const CONTROL_MAX: usize = 1024 * 1024;
/// Maximum DATA payload size in bytes.
pub const DATA_MAX: usize = 256 * 1024;
/// Frame header length: kind byte + big-endian u32 length.
pub const HEADER_LEN: usize = 5;

const KIND_CONTROL: u8 = 1;
const KIND_DATA: u8 = 2;

/// A single unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 JSON control payload.
    Control(Bytes),
    /// Opaque PTY/stdin bytes.
    Data(Bytes),
}

/// Framing violations. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    UnknownKind(u8),
    Oversized { kind: u8, len: usize, max: usize },
    Malformed(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind(k) => write!(f, "unknown frame kind {k}"),
            Self::Oversized { kind, len, max } => {
                write!(f, "frame kind {kind} payload {len} exceeds cap {max}")
            }
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    /// Encode a CONTROL frame from a serializable message.
    pub fn control<T: Serialize>(msg: &T) -> anyhow::Result<Self> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > CONTROL_MAX {
            return Err(FrameError::Oversized {
                kind: KIND_CONTROL,
                len: payload.len(),
                max: CONTROL_MAX,
            }
            .into());
        }
        Ok(Self::Control(Bytes::from(payload)))
    }

    /// Decode the CONTROL payload into a typed message.
    pub fn parse_control<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        match self {
            Self::Control(payload) => {
                serde_json::from_slice(payload).map_err(|e| FrameError::Malformed(format!("invalid JSON: {e}")))
            }
            Self::Data(_) => Err(FrameError::Malformed("frame is DATA, not CONTROL".to_owned())),
        }
    }

    fn kind_byte(&self) -> u8 {
        match self {
            Self::Control(_) => KIND_CONTROL,
            Self::Data(_) => KIND_DATA,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Control(p) | Self::Data(p) => p,
        }
    }

    /// Serialize header + payload into a single buffer.
    pub fn encode(&self) -> Bytes {
        let payload = self.payload();
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        out.put_u8(self.kind_byte());
        out.put_u32(payload.len() as u32);
        out.extend_from_slice(payload);
        out.freeze()
    }

    /// Parse exactly one frame from a complete buffer (WebSocket message
    /// body). Trailing bytes are a protocol error: senders must not pack
    /// or split frames across messages.
    pub fn parse(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Malformed(format!(
                "message body {} is shorter than a frame header",
                buf.len()
            )));
        }
        let kind = buf.get_u8();
        let len = buf.get_u32() as usize;
        let max = frame_cap(kind)?;
        if len > max {
            return Err(FrameError::Oversized { kind, len, max });
        }
        if buf.len() != len {
            return Err(FrameError::Malformed(format!(
                "frame length {len} does not match message body {}",
                buf.len()
            )));
        }
        Ok(match kind {
            KIND_CONTROL => Self::Control(buf),
            _ => Self::Data(buf),
        })
    }

    /// Split a byte chunk into as many DATA frames as the per-frame cap
    /// requires. Zero-length input produces a single empty frame.
    pub fn split_data(data: Bytes) -> Vec<Self> {
        if data.is_empty() {
            return vec![Self::Data(data)];
        }
        let mut out = Vec::with_capacity(data.len().div_ceil(DATA_MAX));
        let mut rest = data;
        while rest.len() > DATA_MAX {
            out.push(Self::Data(rest.split_to(DATA_MAX)));
        }
        out.push(Self::Data(rest));
        out
    }
}

fn frame_cap(kind: u8) -> Result<usize, FrameError> {
    match kind {
        KIND_CONTROL => Ok(CONTROL_MAX),
        KIND_DATA => Ok(DATA_MAX),
        other => Err(FrameError::UnknownKind(other)),
    }
}

/// Read one frame from a byte stream. Returns `Ok(None)` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let max = frame_cap(kind)?;
    if len > max {
        return Err(FrameError::Oversized { kind, len, max }.into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let payload = Bytes::from(payload);
    Ok(Some(match kind {
        KIND_CONTROL => Frame::Control(payload),
        _ => Frame::Data(payload),
    }))
}

/// Write one frame to a byte stream and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
