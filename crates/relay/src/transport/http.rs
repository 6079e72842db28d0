// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin HTTP handlers: node registration, listing, revocation.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RelayError;
use crate::state::{epoch_ms, RelayState};
use crate::store::NodeRecord;
use crate::transport::auth::validate_admin;

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub node_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNodeResponse {
    pub status: String,
    pub node_token: String,
    pub node_name: String,
}

#[derive(Debug, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteNodeResponse {
    pub status: String,
    pub node_name: String,
}

/// `GET /healthz`
pub async fn healthz() -> &'static str {
    "ok"
}

/// `GET /api/v1/nodes` — admin: names plus liveness.
pub async fn list_nodes(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = validate_admin(&headers, state.config.admin_token.as_deref()) {
        return e.to_http_response("unauthorized").into_response();
    }
    let nodes = match state.store.list_nodes() {
        Ok(nodes) => nodes,
        Err(e) => return RelayError::Internal.to_http_response(e.to_string()).into_response(),
    };
    let now = epoch_ms();
    let summaries: Vec<NodeSummary> = nodes
        .into_iter()
        .map(|n| NodeSummary {
            connected: state.node_connected(&n.name, n.last_seen_at_ms, now),
            name: n.name,
        })
        .collect();
    Json(summaries).into_response()
}

/// `POST /api/v1/nodes` — admin: register a node, minting a fresh token.
pub async fn create_node(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<CreateNodeRequest>,
) -> impl IntoResponse {
    if let Err(e) = validate_admin(&headers, state.config.admin_token.as_deref()) {
        return e.to_http_response("unauthorized").into_response();
    }
    if req.node_name.is_empty() || req.node_name.len() > 64 {
        return RelayError::BadRequest
            .to_http_response("node_name must be 1-64 chars")
            .into_response();
    }

    let token = match generate_token() {
        Ok(token) => token,
        Err(e) => return RelayError::Internal.to_http_response(e.to_string()).into_response(),
    };
    let record = NodeRecord {
        name: req.node_name.clone(),
        token: token.clone(),
        external_identity: None,
        authorized_at_ms: epoch_ms(),
        last_seen_at_ms: 0,
    };
    if let Err(e) = state.store.create_node(record) {
        return RelayError::Conflict.to_http_response(e.to_string()).into_response();
    }

    info!(node = %req.node_name, "node registered");
    Json(CreateNodeResponse {
        status: "created".to_owned(),
        node_token: token,
        node_name: req.node_name,
    })
    .into_response()
}

/// `DELETE /api/v1/nodes/{name}` — admin: revoke a node.
pub async fn delete_node(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = validate_admin(&headers, state.config.admin_token.as_deref()) {
        return e.to_http_response("unauthorized").into_response();
    }
    match state.store.delete_node(&name) {
        Ok(true) => {
            info!(node = %name, "node revoked");
            Json(DeleteNodeResponse { status: "deleted".to_owned(), node_name: name })
                .into_response()
        }
        Ok(false) => RelayError::NodeNotFound.to_http_response("unknown node").into_response(),
        Err(e) => RelayError::Internal.to_http_response(e.to_string()).into_response(),
    }
}

/// Mint a 32-byte (256-bit) token, hex encoded.
pub fn generate_token() -> anyhow::Result<String> {
    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("system rng unavailable"))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
