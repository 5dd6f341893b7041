//! Bounded per-channel observation history
//!
//! Purely observational: the control surface reads it, correlation
//! correctness never depends on it.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default history capacity per channel
pub const DEFAULT_HISTORY_CAP: usize = 50;

/// One remembered observation
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Arrival time, milliseconds since the Unix epoch
    pub at_epoch_ms: u64,
    pub summary: String,
}

impl HistoryEntry {
    pub fn new(at: SystemTime, summary: String) -> Self {
        let at_epoch_ms = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { at_epoch_ms, summary }
    }
}

/// Fixed-capacity ordered log, oldest evicted when full
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
}

impl HistoryBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries in arrival order, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}
