// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dungeonclaw: the grid-world agent server. Wires the core simulation
//! crate to HTTP, WebSocket, and SSE transports behind a tick-driven
//! background loop.

pub mod config;
pub mod error;
pub mod state;
pub mod tick_loop;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::DungeonclawConfig;
use crate::state::AppState;
use crate::tick_loop::spawn_tick_loop;
use crate::transport::build_router;

/// Run the server until shutdown.
pub async fn run(config: DungeonclawConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState::new(config, shutdown.clone()));
    tracing::info!("dungeonclaw listening on {addr}");

    spawn_tick_loop(Arc::clone(&state));

    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
