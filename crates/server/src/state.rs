// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio_util::sync::CancellationToken;

use dungeonclaw_core::auth::AuthStore;
use dungeonclaw_core::challenge::ChallengeService;
use dungeonclaw_core::engine::{TickEngine, TickEngineConfig};

use crate::config::DungeonclawConfig;

/// Shared server state, threaded through every handler via `State<Arc<AppState>>`.
pub struct AppState {
    pub engine: TickEngine,
    pub auth: AuthStore,
    pub challenges: ChallengeService,
    pub config: DungeonclawConfig,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: DungeonclawConfig, shutdown: CancellationToken) -> Self {
        let engine_config = TickEngineConfig {
            tick_hz: config.tick_hz,
            width: config.chunk_width,
            height: config.chunk_height,
            root_seed: config.root_seed,
            chunk_gc_ttl_seconds: config.chunk_gc_ttl_seconds,
            sse_replay_max_events: config.sse_replay_max_events,
        };

        Self {
            engine: TickEngine::new(engine_config),
            auth: AuthStore::new(config.session_ttl_seconds),
            challenges: ChallengeService::new(
                config.challenge_expires_seconds,
                config.challenge_ttl_seconds,
                config.challenge_default_difficulty,
            ),
            config,
            shutdown,
        }
    }
}
