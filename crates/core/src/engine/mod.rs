// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The tick engine: a single-writer simulation loop over an on-demand graph
//! of map chunks. All public operations serialise against the same lock as
//! `tick_once`, so no caller can observe a torn tick.

pub mod chunk;
pub mod command;

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::chunkgen::{self, Direction};
use crate::error::Reason;
use crate::pathfinder::{self, Cell};
use chunk::ChunkState;
use command::{AgentEntity, MoveCommand};

pub const ROOT_CHUNK_ID: &str = "chunk-0";
const LISTENER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub kind: &'static str,
    pub payload: Value,
}

pub type Listener = mpsc::Sender<EngineEvent>;

#[derive(Debug, Clone)]
pub struct TickEngineConfig {
    pub tick_hz: u32,
    pub width: i32,
    pub height: i32,
    pub root_seed: u64,
    pub chunk_gc_ttl_seconds: i64,
    pub sse_replay_max_events: usize,
}

/// Deterministic seed for a chunk materialised across edge `d` of a parent
/// seeded with `parent_seed`. A small splitmix64-style mix, not tied to any
/// hasher whose output is not guaranteed stable across toolchain versions.
fn mix_seed(parent_seed: u64, d: Direction) -> u64 {
    let mut h = parent_seed ^ 0x9E37_79B9_7F4A_7C15;
    h = h.wrapping_add(d as u64 + 1);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// If the next step lands on the outward edge of the grid in direction `d`
/// (i.e. the agent is crossing out of this chunk), returns `d`.
fn edge_direction_for_step(current: Cell, next: Cell, width: i32, height: i32) -> Option<Direction> {
    if next.1 == current.1 && next.0 == 0 && current.0 == 1 {
        Some(Direction::W)
    } else if next.1 == current.1 && next.0 == width - 1 && current.0 == width - 2 {
        Some(Direction::E)
    } else if next.0 == current.0 && next.1 == 0 && current.1 == 1 {
        Some(Direction::N)
    } else if next.0 == current.0 && next.1 == height - 1 && current.1 == height - 2 {
        Some(Direction::S)
    } else {
        None
    }
}

/// Where an agent lands in chunk B after crossing out of A via direction `d`.
fn entry_cell_for(d: Direction, width: i32, height: i32, across: i32) -> Cell {
    match d {
        Direction::W => (width - 1, across),
        Direction::E => (0, across),
        Direction::N => (across, 0),
        Direction::S => (across, height - 1),
    }
}

fn agent_snapshots(chunk: &ChunkState, agents: &HashMap<String, AgentEntity>) -> Vec<Value> {
    let mut snapshots: Vec<Value> = chunk
        .agents
        .iter()
        .filter_map(|id| agents.get(id))
        .map(|a| json!({"id": a.agent_id, "x": a.x, "y": a.y}))
        .collect();
    snapshots.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    snapshots
}

fn chunk_static_value(chunk: &ChunkState, tick: u64) -> Value {
    let neighbors: HashMap<&str, Option<String>> =
        chunk.neighbors.iter().map(|(d, id)| (d.as_str(), id.clone())).collect();
    json!({
        "chunk_id": chunk.chunk_id,
        "size": {"w": chunk.width, "h": chunk.height},
        "tiles": chunk.tiles.as_rows(),
        "legend": {".": "floor", "#": "wall"},
        "neighbors": neighbors,
        "tick_base": tick,
    })
}

fn chunk_delta_value(chunk: &ChunkState, agents: &HashMap<String, AgentEntity>, tick: u64, events: Vec<Value>) -> Value {
    json!({
        "chunk_id": chunk.chunk_id,
        "tick": tick,
        "agents": agent_snapshots(chunk, agents),
        "events": events,
    })
}

struct Inner {
    tick: u64,
    accept_serial: u64,
    chunk_serial: u64,
    chunks: HashMap<String, ChunkState>,
    agents: HashMap<String, AgentEntity>,
    pending: VecDeque<MoveCommand>,
    executing: HashMap<String, MoveCommand>,
    agent_active_cmd: HashMap<String, String>,
    agent_listeners: HashMap<String, Vec<Listener>>,
    chunk_listeners: HashMap<String, Vec<Listener>>,
}

/// A finished command's terminal outcome, captured instead of raised — no
/// error crosses a tick boundary as an exception.
struct Outcome {
    server_cmd_id: String,
    agent_id: String,
    status: &'static str,
    reason: Option<Reason>,
    blocked_at: Option<Cell>,
    blocker: Option<String>,
}

enum CrossResult {
    Blocked { blocker: String },
    Moved { to_chunk: String },
}

pub struct TickEngine {
    config: TickEngineConfig,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
    inner: Mutex<Inner>,
}

impl TickEngine {
    pub fn new(config: TickEngineConfig) -> Self {
        Self::with_clock(config, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        })
    }

    pub fn with_clock(config: TickEngineConfig, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        let now = clock();
        let root_layout = config.width >= 20 && config.height >= 20;
        let required: HashSet<Direction> = Direction::ALL.into_iter().collect();
        let tiles = chunkgen::generate(config.width, config.height, config.root_seed, &required, root_layout);
        let root = ChunkState::new(
            ROOT_CHUNK_ID.to_owned(),
            config.width,
            config.height,
            config.root_seed,
            tiles,
            true,
            now,
            config.sse_replay_max_events,
        );

        let mut chunks = HashMap::new();
        chunks.insert(ROOT_CHUNK_ID.to_owned(), root);
        tracing::info!(width = config.width, height = config.height, root_layout, "tick engine initialized");

        Self {
            config,
            clock: Box::new(clock),
            inner: Mutex::new(Inner {
                tick: 0,
                accept_serial: 0,
                chunk_serial: 0,
                chunks,
                agents: HashMap::new(),
                pending: VecDeque::new(),
                executing: HashMap::new(),
                agent_active_cmd: HashMap::new(),
                agent_listeners: HashMap::new(),
                chunk_listeners: HashMap::new(),
            }),
        }
    }

    pub async fn tick(&self) -> u64 {
        self.inner.lock().await.tick
    }

    pub async fn has_chunk(&self, chunk_id: &str) -> bool {
        self.inner.lock().await.chunks.contains_key(chunk_id)
    }

    pub async fn chunk_count(&self) -> usize {
        self.inner.lock().await.chunks.len()
    }

    pub async fn agent_state(&self, agent_id: &str) -> Option<(String, i32, i32)> {
        let inner = self.inner.lock().await;
        inner.agents.get(agent_id).map(|a| (a.chunk_id.clone(), a.x, a.y))
    }

    /// Registers a listener and returns both ends; the caller owns the
    /// receiver and drives the transport loop from it.
    pub async fn register_listener(&self, agent_id: &str) -> (Listener, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().await;
        inner.agent_listeners.entry(agent_id.to_owned()).or_default().push(tx.clone());
        (tx, rx)
    }

    pub async fn unregister_listener(&self, agent_id: &str, listener: &Listener) {
        let mut inner = self.inner.lock().await;
        if let Some(listeners) = inner.agent_listeners.get_mut(agent_id) {
            listeners.retain(|l| !l.same_channel(listener));
            if listeners.is_empty() {
                inner.agent_listeners.remove(agent_id);
            }
        }
    }

    /// Registers a spectator listener for every `chunk_delta`/`chunk_transition`/
    /// `chunk_closed` event on `chunk_id` going forward. Pair with
    /// `open_spectator_feed` for the bootstrap snapshot and replay tail.
    pub async fn register_chunk_listener(&self, chunk_id: &str) -> Result<(Listener, mpsc::Receiver<EngineEvent>), Reason> {
        let mut inner = self.inner.lock().await;
        if !inner.chunks.contains_key(chunk_id) {
            return Err(Reason::ChunkNotFound);
        }
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        inner.chunk_listeners.entry(chunk_id.to_owned()).or_default().push(tx.clone());
        Ok((tx, rx))
    }

    pub async fn unregister_chunk_listener(&self, chunk_id: &str, listener: &Listener) {
        let mut inner = self.inner.lock().await;
        if let Some(listeners) = inner.chunk_listeners.get_mut(chunk_id) {
            listeners.retain(|l| !l.same_channel(listener));
            if listeners.is_empty() {
                inner.chunk_listeners.remove(chunk_id);
            }
        }
    }

    pub async fn ensure_agent(&self, agent_id: &str) -> Result<(String, i32, i32), Reason> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.agents.get(agent_id) {
            return Ok((existing.chunk_id.clone(), existing.x, existing.y));
        }

        let width = self.config.width;
        let height = self.config.height;
        let root = inner.chunks.get_mut(ROOT_CHUNK_ID).ok_or(Reason::ChunkNotFound)?;
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let cell = (x, y);
                if root.occupancy.contains_key(&cell) || !root.tiles.is_floor(cell) {
                    continue;
                }
                root.occupancy.insert(cell, agent_id.to_owned());
                root.agents.insert(agent_id.to_owned());
                let entity =
                    AgentEntity { agent_id: agent_id.to_owned(), chunk_id: ROOT_CHUNK_ID.to_owned(), x, y };
                inner.agents.insert(agent_id.to_owned(), entity.clone());
                return Ok((entity.chunk_id, entity.x, entity.y));
            }
        }
        Err(Reason::NoSpawnAvailable)
    }

    pub async fn remove_agent(&self, agent_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.agent_active_cmd.remove(agent_id);

        let stale: Vec<String> =
            inner.pending.iter().filter(|c| c.agent_id == agent_id).map(|c| c.server_cmd_id.clone()).collect();
        if !stale.is_empty() {
            inner.pending.retain(|c| c.agent_id != agent_id);
            for id in stale {
                inner.executing.remove(&id);
            }
        }
        inner.executing.retain(|_, cmd| cmd.agent_id != agent_id);

        if let Some(entity) = inner.agents.remove(agent_id) {
            let now = (self.clock)();
            if let Some(chunk) = inner.chunks.get_mut(&entity.chunk_id) {
                chunk.occupancy.remove(&(entity.x, entity.y));
                chunk.agents.remove(agent_id);
                if chunk.agents.is_empty() {
                    chunk.last_player_left_at = Some(now);
                }
            }
        }
    }

    pub async fn has_active_command(&self, agent_id: &str) -> bool {
        self.inner.lock().await.agent_active_cmd.contains_key(agent_id)
    }

    pub async fn submit_move_command(
        &self,
        agent_id: &str,
        server_cmd_id: &str,
        target_x: i32,
        target_y: i32,
    ) -> Result<u64, Reason> {
        let mut inner = self.inner.lock().await;

        let agent = inner.agents.get(agent_id).ok_or(Reason::AgentNotFound)?.clone();

        if inner.agent_active_cmd.contains_key(agent_id) {
            return Err(Reason::Busy);
        }

        let chunk = inner.chunks.get(&agent.chunk_id).ok_or(Reason::ChunkNotFound)?;
        if !(0..chunk.width).contains(&target_x) || !(0..chunk.height).contains(&target_y) {
            return Err(Reason::OutOfBounds);
        }

        let start = agent.cell();
        let goal = (target_x, target_y);
        let width = chunk.width;
        let height = chunk.height;
        let path = pathfinder::find_path(width, height, start, goal, |cell| chunk.is_blocked_for(cell, agent_id))
            .ok_or(Reason::Unreachable)?;

        inner.accept_serial += 1;
        let accepted_tick = inner.tick + 1;
        let cmd = MoveCommand {
            server_cmd_id: server_cmd_id.to_owned(),
            agent_id: agent_id.to_owned(),
            target: goal,
            path,
            accepted_tick,
            accepted_order: inner.accept_serial,
            path_index: 0,
        };
        inner.pending.push_back(cmd);
        inner.agent_active_cmd.insert(agent_id.to_owned(), server_cmd_id.to_owned());
        tracing::debug!(agent_id, server_cmd_id, target_x, target_y, accepted_tick, "move command admitted");
        Ok(accepted_tick)
    }

    pub async fn chunk_static_payload(&self, chunk_id: &str) -> Result<Value, Reason> {
        let inner = self.inner.lock().await;
        let chunk = inner.chunks.get(chunk_id).ok_or(Reason::ChunkNotFound)?;
        Ok(chunk_static_value(chunk, inner.tick))
    }

    pub async fn chunk_delta_payload(&self, chunk_id: &str) -> Result<Value, Reason> {
        let inner = self.inner.lock().await;
        let chunk = inner.chunks.get(chunk_id).ok_or(Reason::ChunkNotFound)?;
        Ok(chunk_delta_value(chunk, &inner.agents, inner.tick, Vec::new()))
    }

    /// Returns `(chunk_static, chunk_delta, resync_required, replay_events)`.
    pub async fn open_spectator_feed(
        &self,
        chunk_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<(Value, Value, bool, Vec<Value>), Reason> {
        let inner = self.inner.lock().await;
        let chunk = inner.chunks.get(chunk_id).ok_or(Reason::ChunkNotFound)?;
        let chunk_static = chunk_static_value(chunk, inner.tick);
        let chunk_delta = chunk_delta_value(chunk, &inner.agents, inner.tick, Vec::new());

        match last_event_id {
            None => Ok((chunk_static, chunk_delta, false, Vec::new())),
            Some(id) => match chunk.events.replay_after(id) {
                Some(events) => {
                    let replay = events
                        .into_iter()
                        .map(|e| json!({"event_id": e.event_id, "name": e.name, "payload": e.payload, "tick": e.tick}))
                        .collect();
                    Ok((chunk_static, chunk_delta, false, replay))
                }
                None => Ok((chunk_static, chunk_delta, true, Vec::new())),
            },
        }
    }

    fn emit_to_agent(inner: &mut Inner, agent_id: &str, event: EngineEvent) {
        let Some(listeners) = inner.agent_listeners.get_mut(agent_id) else { return };
        listeners.retain(|tx| !matches!(tx.try_send(event.clone()), Err(mpsc::error::TrySendError::Closed(_))));
        if listeners.is_empty() {
            inner.agent_listeners.remove(agent_id);
        }
    }

    fn emit_to_chunk(inner: &mut Inner, chunk_id: &str, event: EngineEvent) {
        let Some(listeners) = inner.chunk_listeners.get_mut(chunk_id) else { return };
        listeners.retain(|tx| !matches!(tx.try_send(event.clone()), Err(mpsc::error::TrySendError::Closed(_))));
        if listeners.is_empty() {
            inner.chunk_listeners.remove(chunk_id);
        }
    }

    /// Registers chunk B as A's neighbour across `d`, lazily generating B if
    /// A's pointer is empty or dangling. Returns B's chunk id.
    fn materialize_neighbor(inner: &mut Inner, from_chunk_id: &str, d: Direction, now: i64) -> String {
        let existing = inner.chunks.get(from_chunk_id).and_then(|c| c.neighbors.get(&d).cloned().flatten());
        if let Some(id) = existing {
            if inner.chunks.contains_key(&id) {
                return id;
            }
        }

        let Some((parent_seed, width, height)) =
            inner.chunks.get(from_chunk_id).map(|parent| (parent.seed, parent.width, parent.height))
        else {
            // Caller only reaches here with an agent's own chunk id, which always
            // exists; fall back to the configured root dimensions defensively.
            return from_chunk_id.to_owned();
        };

        inner.chunk_serial += 1;
        let new_id = format!("chunk-{}", inner.chunk_serial);
        let seed = mix_seed(parent_seed, d);
        let required: HashSet<Direction> = std::iter::once(d.opposite()).collect();
        let tiles = chunkgen::generate(width, height, seed, &required, false);
        let new_chunk = ChunkState::new(new_id.clone(), width, height, seed, tiles, false, now, 256);
        inner.chunks.insert(new_id.clone(), new_chunk);
        tracing::debug!(chunk_id = %new_id, from_chunk_id = %from_chunk_id, direction = ?d, "materialized chunk");

        if let Some(parent) = inner.chunks.get_mut(from_chunk_id) {
            parent.neighbors.insert(d, Some(new_id.clone()));
        }
        if let Some(child) = inner.chunks.get_mut(&new_id) {
            child.neighbors.insert(d.opposite(), Some(from_chunk_id.to_owned()));
        }
        new_id
    }

    fn cross_boundary(
        inner: &mut Inner,
        agent: &AgentEntity,
        d: Direction,
        now: i64,
    ) -> CrossResult {
        let from_chunk_id = agent.chunk_id.clone();
        let to_chunk_id = Self::materialize_neighbor(inner, &from_chunk_id, d, now);

        let Some((from_width, from_height)) = inner.chunks.get(&from_chunk_id).map(|c| (c.width, c.height)) else {
            return CrossResult::Moved { to_chunk: to_chunk_id };
        };

        if let Some(from) = inner.chunks.get_mut(&from_chunk_id) {
            from.transition_lock_count += 1;
        }
        if let Some(to) = inner.chunks.get_mut(&to_chunk_id) {
            to.transition_lock_count += 1;
        }

        let release_locks = |inner: &mut Inner| {
            if let Some(from) = inner.chunks.get_mut(&from_chunk_id) {
                from.transition_lock_count = from.transition_lock_count.saturating_sub(1);
            }
            if let Some(to) = inner.chunks.get_mut(&to_chunk_id) {
                to.transition_lock_count = to.transition_lock_count.saturating_sub(1);
            }
        };

        let boundary_cell = match d {
            Direction::W => (0, agent.y),
            Direction::E => (from_width - 1, agent.y),
            Direction::N => (agent.x, 0),
            Direction::S => (agent.x, from_height - 1),
        };
        let boundary_occupant =
            inner.chunks.get(&from_chunk_id).and_then(|c| c.occupancy.get(&boundary_cell).cloned());
        if let Some(occupant) = boundary_occupant {
            if occupant != agent.agent_id {
                release_locks(inner);
                return CrossResult::Blocked { blocker: occupant };
            }
        }

        let across = match d {
            Direction::W | Direction::E => agent.y,
            Direction::N | Direction::S => agent.x,
        };
        let Some((to_width, to_height)) = inner.chunks.get(&to_chunk_id).map(|c| (c.width, c.height)) else {
            release_locks(inner);
            return CrossResult::Moved { to_chunk: to_chunk_id };
        };
        let entry_cell = entry_cell_for(d, to_width, to_height, across);

        let entry_occupant = inner.chunks.get(&to_chunk_id).and_then(|c| c.occupancy.get(&entry_cell).cloned());
        if let Some(occupant) = entry_occupant {
            if occupant != agent.agent_id {
                release_locks(inner);
                return CrossResult::Blocked { blocker: occupant };
            }
        }

        if let Some(from) = inner.chunks.get_mut(&from_chunk_id) {
            from.occupancy.remove(&agent.cell());
            from.agents.remove(&agent.agent_id);
            if from.agents.is_empty() {
                from.last_player_left_at = Some(now);
            }
            from.transition_lock_count = from.transition_lock_count.saturating_sub(1);
        }
        if let Some(to) = inner.chunks.get_mut(&to_chunk_id) {
            to.occupancy.insert(entry_cell, agent.agent_id.clone());
            to.agents.insert(agent.agent_id.clone());
            to.last_player_left_at = None;
            to.transition_lock_count = to.transition_lock_count.saturating_sub(1);
        }
        if let Some(entity) = inner.agents.get_mut(&agent.agent_id) {
            entity.chunk_id = to_chunk_id.clone();
            entity.x = entry_cell.0;
            entity.y = entry_cell.1;
        }

        CrossResult::Moved { to_chunk: to_chunk_id }
    }

    /// Advances the world by exactly one tick. Mutates all state atomically
    /// with respect to every other public operation.
    pub async fn tick_once(&self) {
        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;
        let now = (self.clock)();

        while let Some(front) = inner.pending.front() {
            if front.accepted_tick > tick {
                break;
            }
            if let Some(cmd) = inner.pending.pop_front() {
                inner.executing.insert(cmd.server_cmd_id.clone(), cmd);
            }
        }

        let mut running: Vec<MoveCommand> = inner.executing.values().cloned().collect();
        running.sort_by(|a, b| {
            (a.accepted_tick, a.accepted_order, &a.agent_id).cmp(&(b.accepted_tick, b.accepted_order, &b.agent_id))
        });

        let mut outcomes: Vec<Outcome> = Vec::new();
        let mut chunk_events: HashMap<String, Vec<Value>> = HashMap::new();
        let mut transitioned_agents: Vec<(String, String, String)> = Vec::new();

        for mut cmd in running {
            let Some(agent) = inner.agents.get(&cmd.agent_id).cloned() else {
                outcomes.push(Outcome {
                    server_cmd_id: cmd.server_cmd_id.clone(),
                    agent_id: cmd.agent_id.clone(),
                    status: "failed",
                    reason: Some(Reason::AgentNotFound),
                    blocked_at: None,
                    blocker: None,
                });
                continue;
            };

            if !inner.chunks.contains_key(&agent.chunk_id) {
                outcomes.push(Outcome {
                    server_cmd_id: cmd.server_cmd_id.clone(),
                    agent_id: cmd.agent_id.clone(),
                    status: "failed",
                    reason: Some(Reason::ChunkNotFound),
                    blocked_at: None,
                    blocker: None,
                });
                continue;
            }

            if cmd.path_index >= cmd.path.len() {
                outcomes.push(Outcome {
                    server_cmd_id: cmd.server_cmd_id.clone(),
                    agent_id: cmd.agent_id.clone(),
                    status: "completed",
                    reason: None,
                    blocked_at: None,
                    blocker: None,
                });
                continue;
            }

            let next_cell = cmd.path[cmd.path_index];
            let current_cell = agent.cell();
            let boundary_direction = edge_direction_for_step(current_cell, next_cell, self.config.width, self.config.height);

            let mut failed = false;
            let completed = if let Some(d) = boundary_direction {
                match Self::cross_boundary(&mut inner, &agent, d, now) {
                    CrossResult::Blocked { blocker } => {
                        outcomes.push(Outcome {
                            server_cmd_id: cmd.server_cmd_id.clone(),
                            agent_id: cmd.agent_id.clone(),
                            status: "failed",
                            reason: Some(Reason::Blocked),
                            blocked_at: Some(next_cell),
                            blocker: Some(blocker),
                        });
                        failed = true;
                        false
                    }
                    CrossResult::Moved { to_chunk } => {
                        transitioned_agents.push((cmd.agent_id.clone(), agent.chunk_id.clone(), to_chunk));
                        cmd.path_index += 1;
                        cmd.path_index >= cmd.path.len()
                    }
                }
            } else {
                let occupant = inner.chunks.get(&agent.chunk_id).and_then(|c| c.occupancy.get(&next_cell).cloned());
                match occupant {
                    Some(occupant_id) if occupant_id != cmd.agent_id => {
                        chunk_events.entry(agent.chunk_id.clone()).or_default().push(json!({
                            "type": "blocked",
                            "by": occupant_id,
                            "at": {"x": next_cell.0, "y": next_cell.1},
                        }));
                        outcomes.push(Outcome {
                            server_cmd_id: cmd.server_cmd_id.clone(),
                            agent_id: cmd.agent_id.clone(),
                            status: "failed",
                            reason: Some(Reason::Blocked),
                            blocked_at: Some(next_cell),
                            blocker: Some(occupant_id),
                        });
                        failed = true;
                        false
                    }
                    _ => {
                        if let Some(chunk) = inner.chunks.get_mut(&agent.chunk_id) {
                            chunk.occupancy.remove(&current_cell);
                            chunk.occupancy.insert(next_cell, cmd.agent_id.clone());
                        }
                        if let Some(entity) = inner.agents.get_mut(&cmd.agent_id) {
                            entity.x = next_cell.0;
                            entity.y = next_cell.1;
                        }
                        chunk_events.entry(agent.chunk_id.clone()).or_default();
                        cmd.path_index += 1;
                        cmd.path_index >= cmd.path.len()
                    }
                }
            };

            if failed {
                continue;
            }

            if completed {
                outcomes.push(Outcome {
                    server_cmd_id: cmd.server_cmd_id.clone(),
                    agent_id: cmd.agent_id.clone(),
                    status: "completed",
                    reason: None,
                    blocked_at: None,
                    blocker: None,
                });
            } else {
                inner.executing.insert(cmd.server_cmd_id.clone(), cmd);
            }
        }

        for outcome in &outcomes {
            inner.executing.remove(&outcome.server_cmd_id);
            inner.agent_active_cmd.remove(&outcome.agent_id);

            let mut payload = json!({
                "server_cmd_id": outcome.server_cmd_id,
                "status": outcome.status,
                "ended_tick": tick,
            });
            if let Some(reason) = outcome.reason {
                payload["reason"] = json!(reason.as_str());
            }
            if let Some(at) = outcome.blocked_at {
                payload["blocked_at"] = json!({"x": at.0, "y": at.1});
            }
            if let Some(blocker) = &outcome.blocker {
                payload["blocker"] = json!({"id": blocker});
            }
            tracing::debug!(
                agent_id = %outcome.agent_id,
                server_cmd_id = %outcome.server_cmd_id,
                status = outcome.status,
                "move command resolved"
            );
            Self::emit_to_agent(&mut inner, &outcome.agent_id, EngineEvent { kind: "command_result", payload });
        }

        for (agent_id, _from_chunk, to_chunk) in &transitioned_agents {
            let transition_payload = {
                let agent = inner.agents.get(agent_id);
                let (tx, ty) = agent.map(|a| (a.x, a.y)).unwrap_or((0, 0));
                json!({
                    "agent_id": agent_id,
                    "from_chunk_id": _from_chunk,
                    "to_chunk_id": to_chunk,
                    "to": {"x": tx, "y": ty},
                    "tick": tick,
                })
            };
            tracing::debug!(agent_id = %agent_id, from_chunk_id = %_from_chunk, to_chunk_id = %to_chunk, "agent crossed chunk boundary");
            Self::emit_to_agent(&mut inner, agent_id, EngineEvent { kind: "chunk_transition", payload: transition_payload });

            let chunk_static = inner.chunks.get(to_chunk).map(|c| chunk_static_value(c, tick));
            if let Some(chunk_static) = chunk_static {
                Self::emit_to_agent(&mut inner, agent_id, EngineEvent { kind: "chunk_static", payload: chunk_static });
            }
        }

        let mut affected_chunks: Vec<String> = chunk_events.keys().cloned().collect();
        for (_, _, to_chunk) in &transitioned_agents {
            if !affected_chunks.contains(to_chunk) {
                affected_chunks.push(to_chunk.clone());
            }
        }
        affected_chunks.sort();

        for chunk_id in &affected_chunks {
            let events = chunk_events.remove(chunk_id).unwrap_or_default();
            let delta_value = match inner.chunks.get(chunk_id) {
                Some(chunk) => chunk_delta_value(chunk, &inner.agents, tick, events),
                None => continue,
            };
            if let Some(chunk) = inner.chunks.get_mut(chunk_id) {
                chunk.events.push(chunk_id, tick, "chunk_delta", delta_value.clone());
            }

            let resident_agents: Vec<String> =
                inner.chunks.get(chunk_id).map(|c| c.agents.iter().cloned().collect()).unwrap_or_default();
            for agent_id in resident_agents {
                Self::emit_to_agent(&mut inner, &agent_id, EngineEvent { kind: "chunk_delta", payload: delta_value.clone() });
            }
            Self::emit_to_chunk(&mut inner, chunk_id, EngineEvent { kind: "chunk_delta", payload: delta_value });
        }

        self.collect_garbage(&mut inner, now);
    }

    /// Removes chunks that are not root, not pinned, empty, free of
    /// in-flight transitions, past their GC TTL, and leaf/isolated in the
    /// neighbour graph. Runs to a fixed point so a chain of empty chunks
    /// collapses in a single tick.
    fn collect_garbage(&self, inner: &mut Inner, now: i64) {
        loop {
            let existing: HashSet<String> = inner.chunks.keys().cloned().collect();
            let mut doomed = Vec::new();
            for (id, chunk) in inner.chunks.iter() {
                if id == ROOT_CHUNK_ID || chunk.pinned {
                    continue;
                }
                if !chunk.agents.is_empty() || chunk.transition_lock_count > 0 {
                    continue;
                }
                let Some(left_at) = chunk.last_player_left_at else { continue };
                if now - left_at < self.config.chunk_gc_ttl_seconds {
                    continue;
                }
                if chunk.live_neighbor_degree(&existing) > 1 {
                    continue;
                }
                doomed.push(id.clone());
            }

            if doomed.is_empty() {
                break;
            }

            for id in &doomed {
                tracing::info!(chunk_id = %id, "garbage-collecting empty chunk");
                Self::emit_to_chunk(inner, id, EngineEvent { kind: "chunk_closed", payload: json!({"chunk_id": id}) });
                inner.chunk_listeners.remove(id);

                if let Some(removed) = inner.chunks.remove(id) {
                    for (d, neighbor_id) in removed.neighbors.iter() {
                        let Some(neighbor_id) = neighbor_id else { continue };
                        if let Some(neighbor) = inner.chunks.get_mut(neighbor_id) {
                            neighbor.neighbors.insert(d.opposite(), None);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn engine_with_clock(now: Arc<AtomicI64>, width: i32, height: i32, ttl: i64) -> TickEngine {
        let config = TickEngineConfig {
            tick_hz: 5,
            width,
            height,
            root_seed: 1,
            chunk_gc_ttl_seconds: ttl,
            sse_replay_max_events: 64,
        };
        TickEngine::with_clock(config, move || now.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn straight_move_completes() {
        let now = Arc::new(AtomicI64::new(0));
        let engine = engine_with_clock(now, 10, 10, 10);
        engine.ensure_agent("a1").await.unwrap_or_else(|e| panic!("{e}"));
        let accepted = engine.submit_move_command("a1", "cmd-1", 3, 1).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(accepted, 1);

        engine.tick_once().await;
        engine.tick_once().await;

        let state = engine.agent_state("a1").await;
        assert_eq!(state.map(|(_, x, y)| (x, y)), Some((3, 1)));
        assert_eq!(engine.tick().await, 2);
    }

    #[tokio::test]
    async fn second_command_is_rejected_as_busy() {
        let now = Arc::new(AtomicI64::new(0));
        let engine = engine_with_clock(now, 10, 10, 10);
        engine.ensure_agent("a1").await.unwrap_or_else(|e| panic!("{e}"));
        engine.submit_move_command("a1", "cmd-1", 3, 1).await.unwrap_or_else(|e| panic!("{e}"));
        let second = engine.submit_move_command("a1", "cmd-2", 4, 1).await;
        assert_eq!(second.err(), Some(Reason::Busy));
    }

    #[tokio::test]
    async fn blocked_by_peer_fails_with_blocked_reason() {
        let now = Arc::new(AtomicI64::new(0));
        let engine = engine_with_clock(now, 10, 10, 10);
        engine.ensure_agent("a1").await.unwrap_or_else(|e| panic!("{e}"));
        engine.ensure_agent("a2").await.unwrap_or_else(|e| panic!("{e}"));
        // a2 spawned at (2,1) given row-major free-cell scan starting at (1,1).
        engine.submit_move_command("a1", "cmd-b", 2, 1).await.unwrap_or_else(|e| panic!("{e}"));

        let (_, rx_unused) = engine.register_listener("a1").await;
        drop(rx_unused);
        engine.tick_once().await;

        let a1_state = engine.agent_state("a1").await;
        assert_eq!(a1_state.map(|(_, x, y)| (x, y)), Some((1, 1)));
    }

    #[tokio::test]
    async fn tick_increases_strictly_by_one() {
        let now = Arc::new(AtomicI64::new(0));
        let engine = engine_with_clock(now, 10, 10, 10);
        for expected in 1..=5u64 {
            engine.tick_once().await;
            assert_eq!(engine.tick().await, expected);
        }
    }

    #[tokio::test]
    async fn world_resets_to_root_when_last_agent_leaves() {
        let now = Arc::new(AtomicI64::new(0));
        let engine = engine_with_clock(Arc::clone(&now), 6, 6, 10);
        engine.ensure_agent("a1").await.unwrap_or_else(|e| panic!("{e}"));
        engine.submit_move_command("a1", "cmd-1", 5, 1).await.unwrap_or_else(|e| panic!("{e}"));
        for _ in 0..6 {
            engine.tick_once().await;
        }

        let (chunk_id, _, _) = engine.agent_state("a1").await.expect("agent exists");
        assert_ne!(chunk_id, ROOT_CHUNK_ID);
        assert_eq!(engine.chunk_count().await, 2);

        engine.remove_agent("a1").await;
        now.store(100, Ordering::SeqCst);
        engine.tick_once().await;

        assert_eq!(engine.chunk_count().await, 1);
        assert!(engine.has_chunk(ROOT_CHUNK_ID).await);
    }
}
