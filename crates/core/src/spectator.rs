// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-chunk event log: a bounded ring buffer stamped with replayable
//! `chunk_id:tick:seq` identifiers, and the last-event-id replay policy
//! consumed by the spectator feed.

use std::collections::VecDeque;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event_id: String,
    pub name: &'static str,
    pub payload: Value,
    pub tick: u64,
}

/// Bounded per-chunk ring of [`EventRecord`]s. `seq` resets to zero at the
/// start of every tick and is rendered as 4 hex digits, matching the wire
/// `event_id` format.
pub struct EventLog {
    capacity: usize,
    events: VecDeque<EventRecord>,
    current_tick: u64,
    seq_in_tick: u32,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), events: VecDeque::new(), current_tick: 0, seq_in_tick: 0 }
    }

    pub fn push(&mut self, chunk_id: &str, tick: u64, name: &'static str, payload: Value) -> EventRecord {
        if tick != self.current_tick {
            self.current_tick = tick;
            self.seq_in_tick = 0;
        }
        let event_id = format!("{chunk_id}:{tick}:{:04x}", self.seq_in_tick);
        self.seq_in_tick += 1;

        let record = EventRecord { event_id, name, payload, tick };
        self.events.push_back(record.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        record
    }

    /// Returns the tail strictly after `last_event_id`, or `None` if that id
    /// has already rolled off the ring (the caller should resync).
    pub fn replay_after(&self, last_event_id: &str) -> Option<Vec<EventRecord>> {
        match self.events.iter().position(|record| record.event_id == last_event_id) {
            Some(index) => Some(self.events.iter().skip(index + 1).cloned().collect()),
            None => None,
        }
    }

    pub fn latest(&self) -> Option<&EventRecord> {
        self.events.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_monotonic_within_a_tick() {
        let mut log = EventLog::new(10);
        let a = log.push("chunk-0", 1, "chunk_delta", Value::Null);
        let b = log.push("chunk-0", 1, "chunk_delta", Value::Null);
        assert_eq!(a.event_id, "chunk-0:1:0000");
        assert_eq!(b.event_id, "chunk-0:1:0001");
    }

    #[test]
    fn seq_resets_on_new_tick() {
        let mut log = EventLog::new(10);
        log.push("chunk-0", 1, "chunk_delta", Value::Null);
        let first_of_tick_two = log.push("chunk-0", 2, "chunk_delta", Value::Null);
        assert_eq!(first_of_tick_two.event_id, "chunk-0:2:0000");
    }

    #[test]
    fn replay_after_known_id_returns_strictly_newer_events() {
        let mut log = EventLog::new(10);
        let a = log.push("chunk-0", 1, "chunk_delta", Value::Null);
        log.push("chunk-0", 2, "chunk_delta", Value::Null);
        log.push("chunk-0", 3, "chunk_delta", Value::Null);

        let replay = log.replay_after(&a.event_id).expect("id still in ring");
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].tick, 2);
        assert_eq!(replay[1].tick, 3);
    }

    #[test]
    fn replay_after_rolled_off_id_signals_resync() {
        let mut log = EventLog::new(2);
        let a = log.push("chunk-0", 1, "chunk_delta", Value::Null);
        log.push("chunk-0", 2, "chunk_delta", Value::Null);
        log.push("chunk-0", 3, "chunk_delta", Value::Null);

        assert!(log.replay_after(&a.event_id).is_none());
    }
}
