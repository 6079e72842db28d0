// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane message types carried in CONTROL frames.
//!
//! Requests and responses are internally-tagged JSON enums
//! (`{"type": "Launch", ...}`). Every reply mirrors its request's tag;
//! failures reply `Error` without closing the connection.

use serde::{Deserialize, Serialize};

/// Default number of bytes returned by `Logs` without an explicit tail.
pub const LOGS_DEFAULT_MAX: usize = 50 * 1024;
/// Cap on bytes collected by a `WatchSession` stream, marker included.
pub const WATCH_DEFAULT_MAX: usize = 100 * 1024;
/// Largest accepted direct-message body.
pub const MSG_BODY_MAX: usize = 64 * 1024;
/// Default entries returned by `MsgRead`.
pub const MSG_READ_DEFAULT: usize = 20;
/// Default `MsgRequest` timeout in seconds.
pub const MSG_REQUEST_TIMEOUT_S: u64 = 60;

/// Client-to-node requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Launch {
        command: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Kill {
        id: u32,
    },
    KillByTags {
        tags: Vec<String>,
    },
    ListSessions {},
    GetStatus {
        id: u32,
    },
    Logs {
        id: u32,
        #[serde(default)]
        follow: bool,
        #[serde(default)]
        tail: Option<usize>,
    },
    SendInput {
        id: u32,
        data: String,
    },
    Resize {
        id: u32,
        cols: u16,
        rows: u16,
    },
    Attach {
        id: u32,
        #[serde(default)]
        from_offset: Option<u64>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    WatchSession {
        id: u32,
        #[serde(default)]
        include_history: bool,
        #[serde(default)]
        history_lines: Option<usize>,
    },
    Subscribe {
        #[serde(default)]
        session_id: Option<u32>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        event_types: Vec<String>,
        #[serde(default)]
        timeout_s: Option<u64>,
    },
    Wait {
        #[serde(default)]
        id: Option<u32>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        condition: WaitCondition,
        #[serde(default)]
        timeout_s: Option<u64>,
    },
    MsgSend {
        to: Recipient,
        body: String,
    },
    MsgRead {
        session: Recipient,
        #[serde(default)]
        limit: Option<usize>,
    },
    MsgRequest {
        to: Recipient,
        body: String,
        #[serde(default)]
        from: Option<Recipient>,
        #[serde(default)]
        timeout_s: Option<u64>,
    },
    MsgReply {
        request_id: String,
        body: String,
    },
    KvGet {
        key: String,
    },
    KvPut {
        key: String,
        value: serde_json::Value,
    },
    KvDelete {
        key: String,
    },
    KvList {},
    Prune {
        #[serde(default)]
        id: Option<u32>,
    },
    PruneByTags {
        tags: Vec<String>,
    },
}

/// Node-to-client replies and stream frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Launched {
        id: u32,
    },
    Killed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Sessions {
        sessions: Vec<SessionInfo>,
    },
    SessionStatus {
        info: SessionInfo,
        output_size: u64,
    },
    LogData {
        data: String,
    },
    InputSent {
        bytes: usize,
    },
    Attached {
        id: u32,
        from_offset: u64,
    },
    Resized {
        cols: u16,
        rows: u16,
    },
    WatchUpdate {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        output: String,
        #[serde(default)]
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<Status>,
        #[serde(default)]
        truncated: bool,
    },
    SubscribeAck {},
    Event {
        session_id: u32,
        event: SessionEvent,
    },
    WaitResult {
        sessions: Vec<SessionInfo>,
        #[serde(default)]
        timed_out: bool,
    },
    MsgSent {
        message_id: String,
    },
    Messages {
        messages: Vec<InboxMessage>,
    },
    MsgResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<InboxMessage>,
        #[serde(default)]
        timed_out: bool,
    },
    Replied {
        delivered: bool,
    },
    KvValue {
        key: String,
        value: serde_json::Value,
    },
    KvOk {},
    KvKeys {
        keys: Vec<String>,
    },
    Pruned {
        count: usize,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

/// Session lifecycle state. Transitions once from `Running` to a terminal
/// state and never leaves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Running,
    Completed { exit_code: i32 },
    Killed,
    Failed { reason: String },
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Snapshot of one session's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub command: Vec<String>,
    pub working_dir: String,
    pub status: Status,
    pub created_at_ms: u64,
}

/// Target of a `Wait` request: all matches must finish, or any one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    #[default]
    All,
    Any,
}

/// Session addressed by numeric id or by unique name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Id(u32),
    Name(String),
}

/// Direct-message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    Request,
    Reply,
}

/// One inbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at_ms: u64,
}

/// Events published by `Subscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session.created")]
    Created { info: SessionInfo },
    #[serde(rename = "session.status")]
    Status { status: Status },
    #[serde(rename = "session.output_chunk_meta")]
    OutputChunkMeta { offset: u64, len: usize },
    #[serde(rename = "session.inbox")]
    Inbox { message_id: String, kind: MessageKind },
}

impl SessionEvent {
    /// The wire name used by `Subscribe` filters.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "session.created",
            Self::Status { .. } => "session.status",
            Self::OutputChunkMeta { .. } => "session.output_chunk_meta",
            Self::Inbox { .. } => "session.inbox",
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
