// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! 4-neighbour A* over a bounded grid with a caller-supplied blocked predicate.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;

/// A grid cell, `(x, y)`.
pub type Cell = (i32, i32);

fn heuristic(a: Cell, b: Cell) -> i32 {
    (a.0 - b.0).abs() + (a.1 - b.1).abs()
}

fn neighbours(cell: Cell, width: i32, height: i32) -> impl Iterator<Item = Cell> {
    let (x, y) = cell;
    [(x + 1, y), (x - 1, y), (x, y + 1), (x, y - 1)]
        .into_iter()
        .filter(move |&(nx, ny)| nx >= 0 && nx < width && ny >= 0 && ny < height)
}

/// Min-heap entry ordered by `(f_score, serial)`, lowest first.
///
/// `serial` is a monotonic insertion counter: ties on `f_score` resolve in
/// insertion order, matching the Python implementation's heap tuple
/// `(f_score, serial, cell)`.
#[derive(Eq, PartialEq)]
struct OpenEntry {
    f_score: i32,
    serial: u64,
    cell: Cell,
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the smallest f_score/serial first.
        other.f_score.cmp(&self.f_score).then_with(|| other.serial.cmp(&self.serial))
    }
}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Find a path from `start` to `goal` on a `width`×`height` grid.
///
/// The returned path excludes `start` and ends at `goal`. `is_blocked` is
/// consulted for every intermediate cell but never for `goal` itself — an
/// agent may always path toward an occupied goal, since it may vacate
/// before the path is walked. Returns `Some(vec![])` if `start == goal`,
/// `None` if no path exists.
pub fn find_path(
    width: i32,
    height: i32,
    start: Cell,
    goal: Cell,
    is_blocked: impl Fn(Cell) -> bool,
) -> Option<Vec<Cell>> {
    if start == goal {
        return Some(Vec::new());
    }

    let mut open_heap = BinaryHeap::new();
    open_heap.push(OpenEntry { f_score: heuristic(start, goal), serial: 0, cell: start });

    let mut g_score: HashMap<Cell, i32> = HashMap::new();
    g_score.insert(start, 0);
    let mut came_from: HashMap<Cell, Cell> = HashMap::new();
    let mut serial: u64 = 0;

    while let Some(OpenEntry { cell: current, .. }) = open_heap.pop() {
        if current == goal {
            let mut path = Vec::new();
            let mut cursor = goal;
            while cursor != start {
                path.push(cursor);
                // `came_from` is populated for every cell reached except `start`,
                // so this lookup cannot miss while walking back from `goal`.
                cursor = match came_from.get(&cursor) {
                    Some(&prev) => prev,
                    None => break,
                };
            }
            path.reverse();
            return Some(path);
        }

        for next in neighbours(current, width, height) {
            if next != goal && is_blocked(next) {
                continue;
            }

            let current_g = *g_score.get(&current).unwrap_or(&i32::MAX);
            let tentative = current_g.saturating_add(1);
            if let Some(&prev) = g_score.get(&next) {
                if tentative >= prev {
                    continue;
                }
            }

            came_from.insert(next, current);
            g_score.insert(next, tentative);
            serial += 1;
            let f_score = tentative + heuristic(next, goal);
            open_heap.push(OpenEntry { f_score, serial, cell: next });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_start_and_goal_is_empty_path() {
        assert_eq!(find_path(10, 10, (3, 3), (3, 3), |_| false), Some(Vec::new()));
    }

    #[test]
    fn straight_line_open_grid() {
        let path = find_path(10, 10, (1, 1), (3, 1), |_| false);
        assert_eq!(path, Some(vec![(2, 1), (3, 1)]));
    }

    #[test]
    fn unreachable_when_goal_fully_enclosed() {
        let blocked = |cell: Cell| cell == (5, 4) || cell == (5, 6) || cell == (4, 5) || cell == (6, 5);
        let path = find_path(10, 10, (0, 0), (5, 5), blocked);
        assert_eq!(path, None);
    }

    #[test]
    fn goal_occupied_is_still_reachable() {
        // Goal is "blocked" per predicate, but the predicate is never consulted for it.
        let path = find_path(10, 10, (1, 1), (2, 1), |cell| cell == (2, 1));
        assert_eq!(path, Some(vec![(2, 1)]));
    }

    #[test]
    fn routes_around_a_wall() {
        let blocked = |cell: Cell| cell.0 == 3 && (0..9).contains(&cell.1);
        let path = find_path(10, 10, (0, 5), (6, 5), blocked).expect("path exists");
        assert_eq!(*path.last().expect("nonempty"), (6, 5));
        assert!(path.iter().all(|&c| !blocked(c)));
    }

    #[test]
    fn out_of_bounds_neighbours_are_skipped() {
        let path = find_path(3, 3, (0, 0), (2, 2), |_| false);
        assert!(path.is_some());
    }
}
