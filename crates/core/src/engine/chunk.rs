// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::{HashMap, HashSet};

use crate::chunkgen::{ChunkTiles, Direction};
use crate::pathfinder::Cell;
use crate::spectator::EventLog;

/// One materialised chunk of the world graph. Neighbours are id-valued, never
/// owning references, so the neighbour graph may contain cycles without
/// Rust ownership trouble.
pub struct ChunkState {
    pub chunk_id: String,
    pub width: i32,
    pub height: i32,
    pub tiles: ChunkTiles,
    pub neighbors: HashMap<Direction, Option<String>>,
    pub occupancy: HashMap<Cell, String>,
    pub agents: HashSet<String>,
    pub seed: u64,
    pub pinned: bool,
    pub created_at: i64,
    pub last_player_left_at: Option<i64>,
    pub transition_lock_count: u32,
    pub events: EventLog,
}

impl ChunkState {
    pub fn new(
        chunk_id: String,
        width: i32,
        height: i32,
        seed: u64,
        tiles: ChunkTiles,
        pinned: bool,
        created_at: i64,
        event_log_capacity: usize,
    ) -> Self {
        let neighbors = Direction::ALL.into_iter().map(|d| (d, None)).collect();
        Self {
            chunk_id,
            width,
            height,
            tiles,
            neighbors,
            occupancy: HashMap::new(),
            agents: HashSet::new(),
            seed,
            pinned,
            created_at,
            last_player_left_at: None,
            transition_lock_count: 0,
            events: EventLog::new(event_log_capacity),
        }
    }

    pub fn is_blocked_for(&self, cell: Cell, excluding_agent: &str) -> bool {
        match self.occupancy.get(&cell) {
            Some(occupant) => occupant != excluding_agent,
            None => false,
        }
    }

    /// Live neighbour count, i.e. directions whose pointer names a chunk.
    /// The GC rule treats a chunk with degree ≤ 1 as a leaf/isolated.
    pub fn live_neighbor_degree(&self, existing: &HashSet<String>) -> usize {
        self.neighbors
            .values()
            .filter(|maybe_id| maybe_id.as_deref().is_some_and(|id| existing.contains(id)))
            .count()
    }
}
