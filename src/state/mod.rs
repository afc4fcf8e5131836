//! Shared aggregation state.
//!
//! Accumulators live in a dense arena addressed by an index assigned when an
//! entity is first seen; a side map translates entity keys to indices. The
//! whole arena sits behind one `RwLock`: ingestion takes the write lock once
//! per sample or once per batch, the renderer takes the read lock only long
//! enough to copy every accumulator.

pub mod accumulator;
pub mod current;

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;

use crate::estimator::Strategy;
use crate::tracer::event::{EntityKey, Sample};

pub use accumulator::{EntitySnapshot, EntityStats, ExactStats, StatsView, TopN};
pub use current::CurrentValues;

struct Slot {
    key: EntityKey,
    stats: EntityStats,
}

struct Inner {
    index: HashMap<EntityKey, usize>,
    slots: Vec<Slot>,
    last_reset: Instant,
    resets: u64,
}

impl Inner {
    #[inline]
    fn stats_mut(&mut self, key: EntityKey, strategy: &Strategy) -> &mut EntityStats {
        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None => {
                let idx = self.slots.len();
                self.slots.push(Slot {
                    key,
                    stats: EntityStats::new(strategy),
                });
                self.index.insert(key, idx);
                tracing::debug!(entity = %key, slot = idx, "tracking new entity");
                idx
            }
        };
        // The index only ever holds positions of pushed slots.
        &mut self.slots[idx].stats
    }
}

/// Process-wide per-entity statistics.
pub struct AggregationState {
    strategy: Strategy,
    started_at: Instant,
    inner: RwLock<Inner>,
}

impl AggregationState {
    /// Creates an empty state whose entities build estimators from `strategy`.
    /// The uptime clock starts now.
    pub fn new(strategy: Strategy) -> Self {
        let now = Instant::now();
        Self {
            strategy,
            started_at: now,
            inner: RwLock::new(Inner {
                index: HashMap::with_capacity(64),
                slots: Vec::with_capacity(64),
                last_reset: now,
                resets: 0,
            }),
        }
    }

    /// Estimator configuration shared by every entity.
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// When the state was created; never moved by interval resets.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Records one sample under its own lock acquisition.
    pub fn record(&self, key: EntityKey, value: u64) {
        let mut inner = self.inner.write();
        inner.stats_mut(key, &self.strategy).record(value);
    }

    /// Records a batch of samples under a single lock acquisition, in order.
    pub fn record_batch(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for sample in samples {
            inner
                .stats_mut(sample.entity, &self.strategy)
                .record(sample.value);
        }
    }

    /// Ensures an accumulator exists for `key` without recording a sample.
    pub fn register(&self, key: EntityKey) {
        let mut inner = self.inner.write();
        inner.stats_mut(key, &self.strategy);
    }

    /// Starts a new interval for every entity.
    pub fn reset_intervals(&self) {
        let mut inner = self.inner.write();
        for slot in &mut inner.slots {
            slot.stats.reset_interval();
        }
        inner.last_reset = Instant::now();
        inner.resets += 1;
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Lifetime sample count summed over all entities.
    pub fn total_count(&self) -> u64 {
        self.inner
            .read()
            .slots
            .iter()
            .map(|s| s.stats.total_count())
            .sum()
    }

    /// Copies every accumulator under one read lock, sorted by key.
    pub fn snapshot(&self) -> StateSnapshot {
        let (mut entities, last_reset, resets) = {
            let inner = self.inner.read();
            let entities: Vec<(EntityKey, EntitySnapshot)> = inner
                .slots
                .iter()
                .map(|slot| (slot.key, slot.stats.snapshot()))
                .collect();
            (entities, inner.last_reset, inner.resets)
        };
        entities.sort_by_key(|(key, _)| *key);

        StateSnapshot {
            taken_at: Instant::now(),
            started_at: self.started_at,
            last_reset,
            resets,
            entities,
        }
    }
}

/// Read-only copy of the aggregation state used for one rendered frame.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub taken_at: Instant,
    pub started_at: Instant,
    pub last_reset: Instant,
    pub resets: u64,
    pub entities: Vec<(EntityKey, EntitySnapshot)>,
}

impl StateSnapshot {
    /// Lifetime sample count summed over all entities.
    pub fn total_count(&self) -> u64 {
        self.entities
            .iter()
            .map(|(_, e)| e.lifetime.exact.count)
            .sum()
    }

    pub fn get(&self, key: EntityKey) -> Option<&EntitySnapshot> {
        self.entities
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, e)| e)
    }
}
