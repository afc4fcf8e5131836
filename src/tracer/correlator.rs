//! Userspace model of the in-kernel issue/completion correlation table.
//!
//! The BPF programs keep the same bounded hash map keyed by the operation's
//! identity; this type mirrors their matching rules so they can be exercised
//! without a kernel.

use std::collections::HashMap;

use crate::tracer::event::EntityKey;

/// Default table size (matches `req_start` in blk_latency.c).
pub const DEFAULT_TABLE_CAPACITY: usize = 65_536;

/// A completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub entity: EntityKey,
    pub elapsed_ns: u64,
}

/// Bounded `op_id -> (entity, issue timestamp)` table.
///
/// When the table is full, issues for new operations are not recorded, just
/// as a full BPF hash map rejects updates. Their completions then miss.
/// Issues whose completion never arrives stay in the table until
/// [`Correlator::clear`].
#[derive(Debug)]
pub struct Correlator {
    in_flight: HashMap<u64, (EntityKey, u64)>,
    capacity: usize,
}

impl Correlator {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: HashMap::with_capacity(capacity.min(4_096)),
            capacity,
        }
    }

    /// Records the start of an operation. Re-issuing a live id overwrites it.
    /// Returns false when the table was full and the issue was not stored.
    pub fn on_issue(&mut self, op_id: u64, entity: EntityKey, timestamp_ns: u64) -> bool {
        if self.in_flight.len() >= self.capacity && !self.in_flight.contains_key(&op_id) {
            return false;
        }
        self.in_flight.insert(op_id, (entity, timestamp_ns));
        true
    }

    /// Matches a completion to its issue. A completion without a matching
    /// issue yields `None` and is never reported as a zero-latency sample.
    pub fn on_complete(&mut self, op_id: u64, timestamp_ns: u64) -> Option<Completion> {
        let (entity, started) = self.in_flight.remove(&op_id)?;
        Some(Completion {
            entity,
            elapsed_ns: timestamp_ns.saturating_sub(started),
        })
    }

    /// Number of issued operations still waiting for completion.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_CAPACITY)
    }
}
