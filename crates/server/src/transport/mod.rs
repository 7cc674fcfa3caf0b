// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket + SSE transport for the dungeonclaw server.

pub mod http;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

fn cors_layer(state: &AppState) -> CorsLayer {
    let raw = state.config.cors_allow_origins.trim();
    if raw == "*" {
        return CorsLayer::permissive();
    }

    let origins: Vec<_> = raw
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

/// Build the axum `Router` with every route, including the `/api/v1/*`
/// aliases for the snapshot/stream/move-to endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);

    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/v1/signup", post(http::signup))
        .route("/v1/keys", post(http::create_key))
        .route("/v1/sessions", post(http::create_session))
        .route("/v1/dev/spectator-session", post(http::dev_spectator_session))
        .route("/v1/dev/agent/move-to", post(http::dev_agent_move_to))
        .route("/api/v1/dev/agent/move-to", post(http::dev_agent_move_to))
        .route("/v1/chunks/{id}/snapshot", get(http::chunk_snapshot))
        .route("/api/v1/chunks/{id}/snapshot", get(http::chunk_snapshot))
        .route("/v1/spectate/stream", get(sse::spectate_stream))
        .route("/api/v1/spectate/stream", get(sse::spectate_stream))
        .route("/v1/agent/ws", get(ws::agent_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
