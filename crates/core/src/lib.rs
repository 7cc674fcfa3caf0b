// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core simulation library for the grid-world server: pathfinding, chunk
//! generation, the command challenge protocol, accounts/sessions, the
//! single-writer tick engine, and the spectator event log. Transports
//! (HTTP/WebSocket/SSE) live in the `dungeonclaw` binary crate and talk to
//! these types exclusively through their public APIs.

pub mod auth;
pub mod challenge;
pub mod chunkgen;
pub mod engine;
pub mod error;
pub mod pathfinder;
pub mod spectator;

pub use engine::{EngineEvent, Listener, TickEngine, TickEngineConfig};
pub use error::{CoreError, Reason};
