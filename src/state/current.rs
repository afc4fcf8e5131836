use std::sync::atomic::{AtomicU64, Ordering};

use crate::tracer::event::EntityKey;

/// Latest instantaneous value per polled entity.
///
/// Written by the poll driver on every iteration and read by the renderer
/// without touching the aggregation lock. The entity set is fixed at
/// construction; slot `i` belongs to `keys()[i]`.
pub struct CurrentValues {
    keys: Vec<EntityKey>,
    cells: Vec<AtomicU64>,
}

impl CurrentValues {
    pub fn new(keys: Vec<EntityKey>) -> Self {
        let cells = keys.iter().map(|_| AtomicU64::new(0)).collect();
        Self { keys, cells }
    }

    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }

    #[inline]
    pub fn store(&self, slot: usize, value: u64) {
        if let Some(cell) = self.cells.get(slot) {
            cell.store(value, Ordering::Relaxed);
        }
    }

    pub fn load(&self, slot: usize) -> Option<u64> {
        self.cells.get(slot).map(|c| c.load(Ordering::Relaxed))
    }

    /// Current value for `key`, if it is a polled entity.
    pub fn get(&self, key: EntityKey) -> Option<u64> {
        let slot = self.keys.iter().position(|k| *k == key)?;
        self.load(slot)
    }
}
