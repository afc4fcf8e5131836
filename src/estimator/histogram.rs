use super::{interpolate, order_position, QuantileEstimator};

/// Default clamp: values above this land in the top bucket.
pub const DEFAULT_MAX_VALUE: u64 = 255;

/// Exact histogram with one counter per integer value in `0..=max_value`.
///
/// Quantiles are exact for the represented range. Values above the clamp
/// saturate into the top bucket.
#[derive(Clone, PartialEq, Eq)]
pub struct ExactHistogram {
    buckets: Vec<u64>,
    count: u64,
}

impl ExactHistogram {
    /// Creates an empty histogram covering `0..=max_value`.
    pub fn new(max_value: u64) -> Self {
        let len = usize::try_from(max_value).map_or(usize::MAX, |m| m.saturating_add(1));
        Self {
            buckets: vec![0; len],
            count: 0,
        }
    }

    /// Largest representable value.
    pub fn max_value(&self) -> u64 {
        self.buckets.len().saturating_sub(1) as u64
    }

    /// Number of samples recorded for exactly `value` (after clamping).
    pub fn bucket(&self, value: u64) -> u64 {
        self.buckets
            .get(self.index(value))
            .copied()
            .unwrap_or_default()
    }

    /// Adds every sample of `other` into `self`. Buckets of `other` beyond
    /// this histogram's clamp saturate into the top bucket.
    pub fn merge(&mut self, other: &Self) {
        for (value, &n) in other.buckets.iter().enumerate() {
            if n == 0 {
                continue;
            }
            let idx = self.index(value as u64);
            if let Some(bucket) = self.buckets.get_mut(idx) {
                *bucket += n;
                self.count += n;
            }
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.buckets.len() * std::mem::size_of::<u64>()
    }

    #[inline]
    fn index(&self, value: u64) -> usize {
        value.min(self.max_value()) as usize
    }

    /// Value of the order statistic at zero-based `rank`.
    fn value_at_rank(&self, rank: u64) -> u64 {
        let mut seen = 0u64;
        for (value, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen > rank {
                return value as u64;
            }
        }
        self.max_value()
    }
}

impl QuantileEstimator for ExactHistogram {
    #[inline]
    fn insert(&mut self, value: u64) {
        let idx = self.index(value);
        if let Some(bucket) = self.buckets.get_mut(idx) {
            *bucket += 1;
            self.count += 1;
        }
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let (lower, frac) = order_position(q, self.count);
        let lo = self.value_at_rank(lower) as f64;
        if frac == 0.0 {
            return Some(lo);
        }
        let hi = self.value_at_rank(lower + 1) as f64;
        Some(interpolate(lo, hi, frac))
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.buckets.fill(0);
        self.count = 0;
    }

    fn snapshot(&self) -> Self {
        self.clone()
    }
}

impl Default for ExactHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VALUE)
    }
}

impl std::fmt::Debug for ExactHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExactHistogram")
            .field("max_value", &self.max_value())
            .field("count", &self.count)
            .finish()
    }
}
