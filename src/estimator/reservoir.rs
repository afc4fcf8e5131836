use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{interpolate, order_position, QuantileEstimator};

/// Default number of retained samples.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Uniform reservoir sample (Algorithm R) of a stream of values.
///
/// The `n`-th sample replaces a uniformly chosen slot with probability
/// `capacity / n`, where `n` counts samples seen by this instance since its
/// last reset. The result is representative but carries no formal error bound.
///
/// Snapshots hold their samples sorted, so a frame that reads many
/// percentiles from one snapshot sorts once.
#[derive(Clone)]
pub struct Reservoir {
    samples: Vec<u64>,
    capacity: usize,
    seen: u64,
    rng: SmallRng,
    /// `samples` is in ascending order.
    sorted: bool,
}

impl Reservoir {
    /// Creates an empty reservoir seeded from OS entropy.
    pub fn new(capacity: usize) -> Self {
        Self::from_rng(capacity, SmallRng::from_entropy())
    }

    /// Creates a reservoir with a deterministic replacement sequence.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self::from_rng(capacity, SmallRng::seed_from_u64(seed))
    }

    fn from_rng(capacity: usize, rng: SmallRng) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
            rng,
            sorted: true,
        }
    }

    /// Maximum number of retained samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples currently retained (at most `capacity`).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the reservoir has reached capacity.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn memory_bytes(&self) -> usize {
        self.samples.capacity() * std::mem::size_of::<u64>()
    }
}

impl QuantileEstimator for Reservoir {
    #[inline]
    fn insert(&mut self, value: u64) {
        self.seen += 1;
        self.sorted = false;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if let Ok(slot) = usize::try_from(slot) {
            if let Some(s) = self.samples.get_mut(slot) {
                *s = value;
            }
        }
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        if self.sorted {
            return sorted_quantile(&self.samples, q);
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        sorted_quantile(&sorted, q)
    }

    fn count(&self) -> u64 {
        self.seen
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.seen = 0;
        self.sorted = true;
    }

    fn snapshot(&self) -> Self {
        let mut copy = self.clone();
        if !copy.sorted {
            copy.samples.sort_unstable();
            copy.sorted = true;
        }
        copy
    }
}

fn sorted_quantile(sorted: &[u64], q: f64) -> Option<f64> {
    let (lower, frac) = order_position(q, sorted.len() as u64);
    let lower = lower as usize;
    let lo = *sorted.get(lower)? as f64;
    if frac == 0.0 {
        return Some(lo);
    }
    let hi = sorted.get(lower + 1).map_or(lo, |v| *v as f64);
    Some(interpolate(lo, hi, frac))
}

impl std::fmt::Debug for Reservoir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservoir")
            .field("capacity", &self.capacity)
            .field("len", &self.samples.len())
            .field("seen", &self.seen)
            .finish()
    }
}
