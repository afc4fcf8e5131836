use crate::estimator::{Estimator, QuantileEstimator, Strategy};

/// Number of largest values retained by [`TopN`].
pub const TOP_N: usize = 5;

/// Exact scalar statistics. Never derived from an estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactStats {
    pub count: u64,
    pub sum: u64,
    pub nonzero: u64,
    min: u64,
    pub max: u64,
}

impl ExactStats {
    pub const fn new() -> Self {
        Self {
            count: 0,
            sum: 0,
            nonzero: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, value: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        if value > 0 {
            self.nonzero += 1;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Smallest recorded value, or 0 when nothing was recorded.
    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    /// Exact arithmetic mean.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Fraction of samples that were non-zero, in `[0, 1]`.
    pub fn utilization(&self) -> Option<f64> {
        (self.count > 0).then(|| self.nonzero as f64 / self.count as f64)
    }
}

impl Default for ExactStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The [`TOP_N`] largest values seen, kept in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopN {
    values: [u64; TOP_N],
    len: usize,
}

impl TopN {
    #[inline]
    pub fn record(&mut self, value: u64) {
        if self.len < TOP_N {
            self.values[self.len] = value;
            self.len += 1;
            self.values[..self.len].sort_unstable();
            return;
        }
        if value <= self.values[0] {
            return;
        }
        self.values[0] = value;
        self.values.sort_unstable();
    }

    /// Retained values, smallest first, largest last.
    pub fn values(&self) -> &[u64] {
        &self.values[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// One window of statistics: an estimator plus its exact companions.
#[derive(Debug, Clone)]
pub struct StatsView {
    pub exact: ExactStats,
    pub top: TopN,
    pub estimator: Estimator,
}

impl StatsView {
    fn new(strategy: &Strategy) -> Self {
        Self {
            exact: ExactStats::new(),
            top: TopN::default(),
            estimator: strategy.build(),
        }
    }

    #[inline]
    fn record(&mut self, value: u64) {
        self.exact.record(value);
        self.top.record(value);
        self.estimator.insert(value);
    }

    fn reset(&mut self) {
        self.exact = ExactStats::new();
        self.top.clear();
        self.estimator.reset();
    }

    fn snapshot(&self) -> Self {
        Self {
            exact: self.exact,
            top: self.top,
            estimator: self.estimator.snapshot(),
        }
    }

    /// Approximate quantile from the estimator.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.estimator.quantile(q)
    }
}

/// Interval and lifetime statistics for one entity.
#[derive(Debug, Clone)]
pub struct EntityStats {
    interval: StatsView,
    lifetime: StatsView,
}

impl EntityStats {
    pub fn new(strategy: &Strategy) -> Self {
        Self {
            interval: StatsView::new(strategy),
            lifetime: StatsView::new(strategy),
        }
    }

    #[inline]
    pub fn record(&mut self, value: u64) {
        self.interval.record(value);
        self.lifetime.record(value);
    }

    /// Starts a new interval. Lifetime statistics are untouched.
    pub fn reset_interval(&mut self) {
        self.interval.reset();
    }

    /// Largest value ever recorded; never decreases.
    pub fn true_max(&self) -> u64 {
        self.lifetime.exact.max
    }

    /// Samples recorded since process start.
    pub fn total_count(&self) -> u64 {
        self.lifetime.exact.count
    }

    pub fn interval(&self) -> &StatsView {
        &self.interval
    }

    pub fn lifetime(&self) -> &StatsView {
        &self.lifetime
    }

    /// Copies both windows; the copy is independent of further records.
    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            interval: self.interval.snapshot(),
            lifetime: self.lifetime.snapshot(),
            true_max: self.true_max(),
        }
    }
}

/// Point-in-time copy of an [`EntityStats`].
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub interval: StatsView,
    pub lifetime: StatsView,
    /// Lifetime maximum, carried into the interval view.
    pub true_max: u64,
}

impl EntitySnapshot {
    /// Maximum since the last interval reset.
    pub fn interval_peak(&self) -> u64 {
        self.interval.exact.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_stats() -> EntityStats {
        EntityStats::new(&Strategy::histogram(255).expect("valid"))
    }

    #[test]
    fn test_known_sequence() {
        let mut stats = histogram_stats();
        for v in [0, 0, 0, 5, 5, 10, 30] {
            stats.record(v);
        }

        let snap = stats.snapshot();
        let exact = snap.lifetime.exact;
        assert_eq!(exact.count, 7);
        assert_eq!(exact.nonzero, 4);
        assert_eq!(exact.max, 30);
        assert_eq!(exact.min(), 0);

        let util = exact.utilization().expect("has data");
        assert!((util - 4.0 / 7.0).abs() < 1e-9);
        let mean = exact.mean().expect("has data");
        assert!((mean - 50.0 / 7.0).abs() < 1e-9);

        assert_eq!(snap.lifetime.quantile(0.5), Some(5.0));
        assert_eq!(snap.interval.quantile(0.5), Some(5.0));
    }

    #[test]
    fn test_true_max_survives_interval_reset() {
        let mut stats = histogram_stats();
        stats.record(90);
        stats.record(3);
        let before = stats.true_max();

        stats.reset_interval();
        stats.record(7);
        let snap = stats.snapshot();

        assert!(snap.true_max >= before);
        assert_eq!(snap.true_max, 90);
        assert_eq!(snap.interval_peak(), 7);
    }

    #[test]
    fn test_reset_keeps_lifetime_counts() {
        let mut stats = histogram_stats();
        for v in 0..10 {
            stats.record(v);
        }
        stats.reset_interval();
        for v in 0..5 {
            stats.record(v);
        }

        assert_eq!(stats.total_count(), 15);
        assert_eq!(stats.interval().exact.count, 5);
        assert_eq!(stats.interval().estimator.count(), 5);
        assert_eq!(stats.lifetime().estimator.count(), 15);
    }

    #[test]
    fn test_empty_interval_after_reset() {
        let mut stats = histogram_stats();
        stats.record(12);
        stats.reset_interval();

        let snap = stats.snapshot();
        assert_eq!(snap.interval.exact.count, 0);
        assert_eq!(snap.interval.exact.mean(), None);
        assert_eq!(snap.interval.exact.utilization(), None);
        assert_eq!(snap.interval.exact.min(), 0);
        assert_eq!(snap.interval.quantile(0.5), None);
        assert!(snap.interval.top.values().is_empty());
    }

    #[test]
    fn test_top_n_keeps_largest() {
        let mut top = TopN::default();
        for v in [5, 1, 9, 3, 7] {
            top.record(v);
        }
        assert_eq!(top.values(), &[1, 3, 5, 7, 9]);

        top.record(2);
        assert_eq!(top.values(), &[2, 3, 5, 7, 9]);
        top.record(100);
        assert_eq!(top.values(), &[3, 5, 7, 9, 100]);
        top.record(1);
        assert_eq!(top.values(), &[3, 5, 7, 9, 100]);

        top.clear();
        assert!(top.values().is_empty());
    }

    #[test]
    fn test_top_n_partial() {
        let mut top = TopN::default();
        top.record(4);
        top.record(2);
        assert_eq!(top.values(), &[2, 4]);
    }

    #[test]
    fn test_sum_saturates() {
        let mut exact = ExactStats::new();
        exact.record(u64::MAX);
        exact.record(10);
        assert_eq!(exact.sum, u64::MAX);
        assert_eq!(exact.count, 2);
    }
}
