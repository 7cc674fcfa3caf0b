// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background driver that advances the tick engine at a fixed rate.

use std::sync::Arc;

use crate::state::AppState;

/// Spawns the single background task that calls `tick_once` at `tick_hz` Hz.
/// Stopping the engine cancels this task via `state.shutdown`; any tick
/// already in flight runs to completion before the loop exits.
pub fn spawn_tick_loop(state: Arc<AppState>) {
    let interval_duration = state.config.tick_interval();
    tracing::info!(tick_hz = state.config.tick_hz, "starting tick loop");

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval_duration);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            state.engine.tick_once().await;
        }

        tracing::info!("tick loop stopped");
    });
}
