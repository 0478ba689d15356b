//! Cursor-indexed log of observed workspace events.
//!
//! Holds the most recent events so a reconnecting subscriber can ask for
//! everything after the last cursor it saw. The log is not durable: anything
//! older than the retained window has to come from a fresh workspace snapshot.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

use crate::types::Cursor;

/// Default number of events retained for replay.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedEntry {
    pub cursor: Cursor,
    pub event: Value,
}

/// Ring of observed events. Not synchronized; the owner wraps it in its own
/// lock so appends and subscriber registration can share one critical section.
#[derive(Debug)]
pub struct ObservedEventLog {
    entries: VecDeque<ObservedEntry>,
    capacity: usize,
    latest: Cursor,
}

impl ObservedEventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_REPLAY_CAPACITY)),
            capacity,
            latest: 0,
        }
    }

    /// Append an event and return the cursor assigned to it.
    pub fn append(&mut self, event: Value) -> Cursor {
        self.latest += 1;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ObservedEntry {
            cursor: self.latest,
            event,
        });
        self.latest
    }

    /// Every retained event with `cursor > after`, plus the oldest retained
    /// cursor when `after` falls before the window.
    pub fn replay_since(&self, after: Cursor) -> (Vec<ObservedEntry>, Option<Cursor>) {
        let gap = self
            .entries
            .front()
            .map(|entry| entry.cursor)
            .filter(|oldest| after.saturating_add(1) < *oldest);

        let events = self
            .entries
            .iter()
            .filter(|entry| entry.cursor > after)
            .cloned()
            .collect();

        (events, gap)
    }

    /// Last assigned cursor, `0` before the first append.
    pub fn current_cursor(&self) -> Cursor {
        self.latest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ObservedEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}
