// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay.

pub mod auth;
pub mod back_ws;
pub mod http;
pub mod node_ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::RelayState;

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/healthz", get(http::healthz))
        // Node control plane
        .route("/node/connect", get(node_ws::node_connect))
        .route("/node/back/{session_id}", get(back_ws::node_back))
        // Admin API
        .route("/api/v1/nodes", get(http::list_nodes).post(http::create_node))
        .route("/api/v1/nodes/{name}", axum::routing::delete(http::delete_node))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
