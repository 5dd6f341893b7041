//! Per-key correlation state and satisfaction logic
//!
//! The map is plain single-threaded data: the daemon gives exclusive
//! ownership to one correlator task, which serializes all mutations and
//! makes observe-evaluate-consume atomic per entry.

use crate::gate::LogicGate;
use crate::types::{ChannelId, GateSatisfied, ObservationKey};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant, SystemTime};

/// Transient record of which channels reported a key since its last reset
#[derive(Debug)]
struct Entry {
    observed_by: BTreeSet<ChannelId>,
    first_seen: Instant,
    last_seen: Instant,
}

/// Correlation state over a fixed set of N channels
#[derive(Debug)]
pub struct CorrelationMap {
    entries: HashMap<ObservationKey, Entry>,
    channel_count: usize,
    ttl: Duration,
}

impl CorrelationMap {
    /// `channel_count` is fixed at startup; `ttl` bounds how long an
    /// unmatched entry may linger.
    pub fn new(channel_count: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            channel_count,
            ttl,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Number of keys still awaiting satisfaction
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Record one observation and evaluate `gate` over the entry.
    ///
    /// Membership is idempotent per channel: a re-report from the same
    /// channel refreshes `last_seen` but never grows the set. When the
    /// gate evaluates true the entry is removed in the same step, so a
    /// satisfied accumulation cannot re-trigger without fresh reports.
    pub fn observe(
        &mut self,
        channel: ChannelId,
        key: ObservationKey,
        gate: LogicGate,
        now: Instant,
    ) -> Option<GateSatisfied> {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            observed_by: BTreeSet::new(),
            first_seen: now,
            last_seen: now,
        });
        entry.observed_by.insert(channel);
        entry.last_seen = now;

        if !gate.evaluate(entry.observed_by.len(), self.channel_count) {
            return None;
        }
        let entry = self.entries.remove(&key)?;
        Some(GateSatisfied {
            key,
            observed_by: entry.observed_by.into_iter().collect(),
            gate,
            at: SystemTime::now(),
        })
    }

    /// Drop entries not reported to within the TTL; returns how many
    /// were evicted. Without this, a never-matched key leaks state
    /// indefinitely.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) <= ttl);
        before - self.entries.len()
    }

    /// Age of the oldest pending entry, if any (status reporting)
    pub fn oldest_pending_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|e| now.duration_since(e.first_seen))
            .max()
    }
}
