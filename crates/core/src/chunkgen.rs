// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deterministic procedural map generation for a single chunk.
//!
//! Grounded in `app/services/chunk_generation.py` (border-ring + deterministic
//! spawn corridor + required-edge anchors), generalized to the room-and-corridor
//! algorithm spec'd for the full engine (rooms, loop corridors, a fixed
//! circular root layout).

use std::collections::{HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pathfinder::Cell;

pub const FLOOR: char = '.';
pub const WALL: char = '#';

/// One of the four cardinal chunk edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    N,
    E,
    S,
    W,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Direction::N, Direction::E, Direction::S, Direction::W];

    pub fn opposite(self) -> Direction {
        match self {
            Direction::N => Direction::S,
            Direction::E => Direction::W,
            Direction::S => Direction::N,
            Direction::W => Direction::E,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::N => "N",
            Direction::E => "E",
            Direction::S => "S",
            Direction::W => "W",
        }
    }
}

/// The generated static tile grid for a chunk.
#[derive(Debug, Clone)]
pub struct ChunkTiles {
    pub width: i32,
    pub height: i32,
    /// Row-major, `rows[y]` indexed by `x`, each cell either [`FLOOR`] or [`WALL`].
    pub rows: Vec<Vec<char>>,
}

impl ChunkTiles {
    fn new(width: i32, height: i32) -> Self {
        Self { width, height, rows: vec![vec![WALL; width as usize]; height as usize] }
    }

    fn set(&mut self, cell: Cell, tile: char) {
        let (x, y) = cell;
        if x >= 0 && x < self.width && y >= 0 && y < self.height {
            self.rows[y as usize][x as usize] = tile;
        }
    }

    pub fn is_floor(&self, cell: Cell) -> bool {
        let (x, y) = cell;
        x >= 0
            && x < self.width
            && y >= 0
            && y < self.height
            && self.rows[y as usize][x as usize] == FLOOR
    }

    /// Render as a vector of row strings, one char per cell (the wire format).
    pub fn as_rows(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.iter().collect()).collect()
    }

    fn carve_rect(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) {
        for y in y0..y1 {
            for x in x0..x1 {
                self.set((x, y), FLOOR);
            }
        }
    }

    fn carve_line(&mut self, start: Cell, end: Cell) {
        let mut cursor = start;
        self.set(cursor, FLOOR);
        while cursor != end {
            cursor = step_towards(cursor, end);
            self.set(cursor, FLOOR);
        }
    }

    /// BFS reachability between two floor cells, used by tests and callers
    /// that want to assert connectivity guarantees independently.
    pub fn connected(&self, a: Cell, b: Cell) -> bool {
        if !self.is_floor(a) || !self.is_floor(b) {
            return false;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(a);
        seen.insert(a);
        while let Some(cur) = queue.pop_front() {
            if cur == b {
                return true;
            }
            let (x, y) = cur;
            for next in [(x + 1, y), (x - 1, y), (x, y + 1), (x, y - 1)] {
                if self.is_floor(next) && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }
}

fn step_towards(a: Cell, b: Cell) -> Cell {
    let (ax, ay) = a;
    let (bx, by) = b;
    if ax < bx {
        (ax + 1, ay)
    } else if ax > bx {
        (ax - 1, ay)
    } else if ay < by {
        (ax, ay + 1)
    } else if ay > by {
        (ax, ay - 1)
    } else {
        a
    }
}

/// Centre cell of edge `d`.
pub fn edge_anchor(width: i32, height: i32, d: Direction) -> Cell {
    let cx = width / 2;
    let cy = height / 2;
    match d {
        Direction::N => (cx, height - 1),
        Direction::E => (width - 1, cy),
        Direction::S => (cx, 0),
        Direction::W => (0, cy),
    }
}

/// One step inward from `edge_anchor(width, height, d)`.
fn inside_anchor(width: i32, height: i32, d: Direction) -> Cell {
    let cx = width / 2;
    let cy = height / 2;
    match d {
        Direction::N => (cx, height - 2),
        Direction::E => (width - 2, cy),
        Direction::S => (cx, 1),
        Direction::W => (1, cy),
    }
}

#[derive(Debug, Clone, Copy)]
struct Room {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
}

impl Room {
    fn centre(self) -> Cell {
        ((self.x0 + self.x1) / 2, (self.y0 + self.y1) / 2)
    }

    fn overlaps(self, other: Room, margin: i32) -> bool {
        self.x0 - margin < other.x1
            && self.x1 + margin > other.x0
            && self.y0 - margin < other.y1
            && self.y1 + margin > other.y0
    }
}

/// Carve the fixed circular root hall used for `root_layout = true` on
/// chunks with both dimensions >= 20.
fn carve_circular_root(tiles: &mut ChunkTiles) {
    let w = tiles.width;
    let h = tiles.height;
    let cx = w / 2;
    let cy = h / 2;
    let radius = (w.min(h) / 2) - 2;

    for y in 0..h {
        for x in 0..w {
            let dx = x - cx;
            let dy = y - cy;
            if dx * dx + dy * dy <= radius * radius {
                tiles.set((x, y), FLOOR);
            }
        }
    }

    // Four centred 4-wide cardinal exit bands running from the hall edge to
    // the chunk boundary.
    let half_band = 2;
    for x in (cx - half_band)..(cx + half_band) {
        for y in 0..h {
            tiles.set((x, y), FLOOR);
        }
    }
    for y in (cy - half_band)..(cy + half_band) {
        for x in 0..w {
            tiles.set((x, y), FLOOR);
        }
    }
}

/// Normal room-and-corridor layout: rejection-sampled rooms, L-corridors
/// between consecutive rooms, loop corridors, and exit bands wired to the
/// nearest room.
fn carve_rooms_and_corridors(
    tiles: &mut ChunkTiles,
    rng: &mut StdRng,
    required_edges: &HashSet<Direction>,
) {
    let w = tiles.width;
    let h = tiles.height;

    let room_count = rng.random_range(4..=14);
    let mut rooms: Vec<Room> = Vec::new();
    let max_attempts = room_count * 40;
    let mut attempts = 0;
    while rooms.len() < room_count as usize && attempts < max_attempts {
        attempts += 1;
        let rw = rng.random_range(2..=10);
        let rh = rng.random_range(2..=10);
        if w - 2 <= rw || h - 2 <= rh {
            continue;
        }
        let x0 = rng.random_range(1..(w - 1 - rw));
        let y0 = rng.random_range(1..(h - 1 - rh));
        let candidate = Room { x0, y0, x1: x0 + rw, y1: y0 + rh };
        if rooms.iter().any(|r| r.overlaps(candidate, 1)) {
            continue;
        }
        rooms.push(candidate);
    }

    if rooms.is_empty() {
        // Degenerate case: grid too small for any room to fit. Fall back to
        // a single central room so exits always have something to wire to.
        let cx = w / 2;
        let cy = h / 2;
        rooms.push(Room { x0: (cx - 1).max(1), y0: (cy - 1).max(1), x1: (cx + 2).min(w - 1), y1: (cy + 2).min(h - 1) });
    }

    for room in &rooms {
        tiles.carve_rect(room.x0, room.y0, room.x1, room.y1);
    }

    // Connect consecutive rooms: a spanning chain guarantees every room
    // (and everything later wired to a room) is mutually reachable.
    for pair in rooms.windows(2) {
        let a = pair[0].centre();
        let b = pair[1].centre();
        tiles.carve_line(a, (b.0, a.1));
        tiles.carve_line((b.0, a.1), b);
    }

    // Loop corridors between random room-centre pairs, ~rooms/3 of them.
    let loop_count = (rooms.len() as i32 / 3).max(0);
    for _ in 0..loop_count {
        if rooms.len() < 2 {
            break;
        }
        let i = rng.random_range(0..rooms.len());
        let j = rng.random_range(0..rooms.len());
        if i == j {
            continue;
        }
        let a = rooms[i].centre();
        let b = rooms[j].centre();
        tiles.carve_line(a, (b.0, a.1));
        tiles.carve_line((b.0, a.1), b);
    }

    // Active exits: required, plus random fill so the total is in [2, 4].
    let mut active: HashSet<Direction> = required_edges.clone();
    let target_total = rng.random_range(2..=4).max(active.len() as i32) as usize;
    let mut candidates: Vec<Direction> =
        Direction::ALL.into_iter().filter(|d| !active.contains(d)).collect();
    while active.len() < target_total && !candidates.is_empty() {
        let idx = rng.random_range(0..candidates.len());
        active.insert(candidates.remove(idx));
    }

    let mut active_sorted: Vec<Direction> = active.into_iter().collect();
    active_sorted.sort();

    for direction in active_sorted {
        let boundary = edge_anchor(w, h, direction);
        let inside = inside_anchor(w, h, direction);

        carve_edge_band(tiles, direction, boundary, 4);
        carve_edge_band(tiles, direction, inside, 4);

        let nearest = rooms
            .iter()
            .min_by_key(|r| manhattan(r.centre(), inside))
            .copied()
            .expect("rooms is non-empty by construction above");
        tiles.carve_line(inside, nearest.centre());
    }
}

fn manhattan(a: Cell, b: Cell) -> i32 {
    (a.0 - b.0).abs() + (a.1 - b.1).abs()
}

fn carve_edge_band(tiles: &mut ChunkTiles, direction: Direction, centre: Cell, band_width: i32) {
    let half = band_width / 2;
    match direction {
        Direction::N | Direction::S => {
            for x in (centre.0 - half)..(centre.0 + half) {
                tiles.set((x, centre.1), FLOOR);
            }
        }
        Direction::E | Direction::W => {
            for y in (centre.1 - half)..(centre.1 + half) {
                tiles.set((centre.0, y), FLOOR);
            }
        }
    }
}

/// Small grids (either dimension < 20) fall back to fully-open borders plus
/// a row-1/col-1 corridor, matching `chunk_generation.py`'s fallback path.
fn carve_small_grid_fallback(tiles: &mut ChunkTiles) {
    let w = tiles.width;
    let h = tiles.height;
    for x in 0..w {
        tiles.set((x, 0), FLOOR);
        tiles.set((x, h - 1), FLOOR);
    }
    for y in 0..h {
        tiles.set((0, y), FLOOR);
        tiles.set((w - 1, y), FLOOR);
    }
    if w > 2 {
        for x in 1..(w - 1) {
            tiles.set((x, 1), FLOOR);
        }
    }
    if h > 2 {
        for y in 1..(h - 1) {
            tiles.set((1, y), FLOOR);
        }
    }
}

/// Generate a deterministic chunk tile grid.
///
/// Same `(width, height, seed, required_edges, root_layout)` always produces
/// an identical grid. `root_layout` only takes effect when both dimensions
/// are >= 20; smaller grids always use the small-grid fallback.
pub fn generate(
    width: i32,
    height: i32,
    seed: u64,
    required_edges: &HashSet<Direction>,
    root_layout: bool,
) -> ChunkTiles {
    let mut tiles = ChunkTiles::new(width, height);
    let mut rng = StdRng::seed_from_u64(seed);

    if root_layout && width >= 20 && height >= 20 {
        carve_circular_root(&mut tiles);
    } else if width < 20 || height < 20 {
        carve_small_grid_fallback(&mut tiles);
        for direction in Direction::ALL {
            let anchor = edge_anchor(width, height, direction);
            tiles.set(anchor, FLOOR);
        }
    } else {
        carve_rooms_and_corridors(&mut tiles, &mut rng, required_edges);
    }

    // Spawn vicinity is always floor (guarantee 2).
    if width > 1 && height > 1 {
        tiles.set((1, 1), FLOOR);
    }

    tiles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(list: &[Direction]) -> HashSet<Direction> {
        list.iter().copied().collect()
    }

    #[test]
    fn deterministic_for_same_seed() {
        let req = dirs(&[Direction::N, Direction::E]);
        let a = generate(50, 50, 424_242, &req, false);
        let b = generate(50, 50, 424_242, &req, false);
        assert_eq!(a.as_rows(), b.as_rows());
    }

    #[test]
    fn different_seeds_typically_differ() {
        let req = dirs(&[Direction::N]);
        let a = generate(50, 50, 1, &req, false);
        let b = generate(50, 50, 2, &req, false);
        assert_ne!(a.as_rows(), b.as_rows());
    }

    #[test]
    fn spawn_vicinity_is_floor() {
        let req = dirs(&[]);
        let tiles = generate(50, 50, 7, &req, false);
        assert!(tiles.is_floor((1, 1)));
    }

    #[test]
    fn required_edges_are_mutually_connected() {
        let req = dirs(&[Direction::N, Direction::E, Direction::S, Direction::W]);
        let tiles = generate(50, 50, 424_242, &req, false);

        let anchors: Vec<Cell> = Direction::ALL.iter().map(|&d| edge_anchor(50, 50, d)).collect();
        for &a in &anchors {
            assert!(tiles.is_floor(a), "anchor {a:?} should be floor");
        }
        for pair in anchors.windows(2) {
            assert!(tiles.connected(pair[0], pair[1]));
        }
    }

    #[test]
    fn root_layout_on_large_grid_has_four_exit_bands() {
        let tiles = generate(50, 50, 9, &HashSet::new(), true);
        for direction in Direction::ALL {
            let anchor = edge_anchor(50, 50, direction);
            assert!(tiles.is_floor(anchor));
        }
        assert!(tiles.connected((25, 49), (49, 25)));
    }

    #[test]
    fn root_layout_ignored_below_20() {
        let req = dirs(&[Direction::N]);
        let a = generate(10, 10, 9, &req, true);
        let b = generate(10, 10, 9, &req, false);
        assert_eq!(a.as_rows(), b.as_rows());
    }

    #[test]
    fn small_grid_fallback_connects_all_anchors() {
        let tiles = generate(6, 6, 1, &HashSet::new(), false);
        let anchors: Vec<Cell> = Direction::ALL.iter().map(|&d| edge_anchor(6, 6, d)).collect();
        for pair in anchors.windows(2) {
            assert!(tiles.connected(pair[0], pair[1]));
        }
        assert!(tiles.is_floor((1, 1)));
    }
}
