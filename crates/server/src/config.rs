// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process configuration, parsed from CLI flags or `DC_`-prefixed
//! environment variables.

use std::time::Duration;

/// Configuration for the dungeonclaw server.
#[derive(Debug, Clone, clap::Args)]
pub struct DungeonclawConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "DC_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "DC_PORT")]
    pub port: u16,

    #[arg(long, default_value = "dev", env = "DC_ENVIRONMENT")]
    pub environment: String,

    #[arg(long, default_value_t = 3600, env = "DC_SESSION_TTL_SECONDS")]
    pub session_ttl_seconds: i64,

    #[arg(long, default_value_t = 5, env = "DC_CHALLENGE_EXPIRES_SECONDS")]
    pub challenge_expires_seconds: i64,

    #[arg(long, default_value_t = 10, env = "DC_CHALLENGE_TTL_SECONDS")]
    pub challenge_ttl_seconds: i64,

    #[arg(long, default_value_t = 2, env = "DC_CHALLENGE_DEFAULT_DIFFICULTY")]
    pub challenge_default_difficulty: u32,

    /// Ticks per second for the background simulation loop.
    #[arg(long, default_value_t = 5, env = "DC_TICK_HZ")]
    pub tick_hz: u32,

    #[arg(long, default_value_t = 50, env = "DC_CHUNK_WIDTH")]
    pub chunk_width: i32,

    #[arg(long, default_value_t = 50, env = "DC_CHUNK_HEIGHT")]
    pub chunk_height: i32,

    #[arg(long, default_value_t = 1, env = "DC_ROOT_SEED")]
    pub root_seed: u64,

    #[arg(long, default_value_t = 60, env = "DC_CHUNK_GC_TTL_SECONDS")]
    pub chunk_gc_ttl_seconds: i64,

    /// Comma-separated list of allowed CORS origins, or `*`.
    #[arg(long, default_value = "*", env = "DC_CORS_ALLOW_ORIGINS")]
    pub cors_allow_origins: String,

    /// Enables `/v1/dev/*` routes and the `test-spectator-token` dev bearer.
    #[arg(long, default_value_t = false, env = "DC_ENABLE_DEV_SPECTATOR_SESSION")]
    pub enable_dev_spectator_session: bool,

    #[arg(long, default_value_t = 15, env = "DC_SSE_KEEPALIVE_SECONDS")]
    pub sse_keepalive_seconds: u64,

    #[arg(long, default_value_t = 256, env = "DC_SSE_REPLAY_MAX_EVENTS")]
    pub sse_replay_max_events: usize,
}

impl DungeonclawConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }

    /// Floored at 5s regardless of a misconfigured lower value.
    pub fn sse_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_seconds.max(5))
    }

    pub fn dev_token(&self) -> &'static str {
        "test-spectator-token"
    }
}
