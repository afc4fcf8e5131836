//! Quantile estimators.
//!
//! Three interchangeable strategies implement [`QuantileEstimator`]:
//!
//! - [`ExactHistogram`]: one exact counter per integer value up to a clamp.
//! - [`Reservoir`]: a fixed-size uniform sample of the raw stream.
//! - [`LogSketch`]: logarithmic buckets with a relative-accuracy guarantee.
//!
//! [`Estimator`] dispatches over them statically so accumulators can hold
//! one inline, and [`Strategy`] builds fresh instances of the configured kind.

pub mod histogram;
pub mod reservoir;
pub mod sketch;

use anyhow::{bail, Result};

pub use histogram::ExactHistogram;
pub use reservoir::Reservoir;
pub use sketch::LogSketch;

/// A resettable summary of a stream of non-negative samples.
pub trait QuantileEstimator {
    /// Adds one sample.
    fn insert(&mut self, value: u64);

    /// Approximate value at rank `q` in `[0, 1]`, or `None` when empty.
    /// Out-of-range `q` is clamped.
    fn quantile(&self, q: f64) -> Option<f64>;

    /// Number of samples inserted since creation or the last reset.
    fn count(&self) -> u64;

    /// Discards all samples.
    fn reset(&mut self);

    /// Returns an independent copy that is unaffected by later inserts.
    fn snapshot(&self) -> Self
    where
        Self: Sized;
}

/// One of the supported estimator strategies.
#[derive(Debug, Clone)]
pub enum Estimator {
    Histogram(ExactHistogram),
    Reservoir(Reservoir),
    Sketch(LogSketch),
}

impl Estimator {
    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            Self::Histogram(h) => h.memory_bytes(),
            Self::Reservoir(r) => r.memory_bytes(),
            Self::Sketch(s) => s.memory_bytes(),
        }
    }
}

impl QuantileEstimator for Estimator {
    #[inline]
    fn insert(&mut self, value: u64) {
        match self {
            Self::Histogram(h) => h.insert(value),
            Self::Reservoir(r) => r.insert(value),
            Self::Sketch(s) => s.insert(value),
        }
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        match self {
            Self::Histogram(h) => h.quantile(q),
            Self::Reservoir(r) => r.quantile(q),
            Self::Sketch(s) => s.quantile(q),
        }
    }

    fn count(&self) -> u64 {
        match self {
            Self::Histogram(h) => h.count(),
            Self::Reservoir(r) => r.count(),
            Self::Sketch(s) => s.count(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Histogram(h) => h.reset(),
            Self::Reservoir(r) => r.reset(),
            Self::Sketch(s) => s.reset(),
        }
    }

    fn snapshot(&self) -> Self {
        match self {
            Self::Histogram(h) => Self::Histogram(h.snapshot()),
            Self::Reservoir(r) => Self::Reservoir(r.snapshot()),
            Self::Sketch(s) => Self::Sketch(s.snapshot()),
        }
    }
}

/// Upper bound on the histogram clamp; one bucket per value.
pub const MAX_HISTOGRAM_VALUE: u64 = 1 << 20;

/// Validated estimator configuration; builds empty estimators on demand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    Histogram { max_value: u64 },
    Reservoir { capacity: usize },
    Sketch { alpha: f64 },
}

impl Strategy {
    /// Exact counts for values in `0..=max_value`; larger values land in the
    /// top bucket. Fails unless `1 <= max_value <= MAX_HISTOGRAM_VALUE`.
    pub fn histogram(max_value: u64) -> Result<Self> {
        if max_value == 0 {
            bail!("histogram max value must be positive");
        }
        if max_value > MAX_HISTOGRAM_VALUE {
            bail!("histogram max value must be at most {MAX_HISTOGRAM_VALUE}");
        }
        Ok(Self::Histogram { max_value })
    }

    /// Uniform sample of at most `capacity` values. Fails on zero capacity.
    pub fn reservoir(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            bail!("reservoir capacity must be positive");
        }
        Ok(Self::Reservoir { capacity })
    }

    /// Log-bucketed sketch with relative accuracy `alpha`, which must be at
    /// least `sketch::MIN_ALPHA` and below one.
    pub fn sketch(alpha: f64) -> Result<Self> {
        sketch::validate_alpha(alpha)?;
        Ok(Self::Sketch { alpha })
    }

    /// Creates an empty estimator of this strategy.
    pub fn build(&self) -> Estimator {
        match *self {
            Self::Histogram { max_value } => Estimator::Histogram(ExactHistogram::new(max_value)),
            Self::Reservoir { capacity } => Estimator::Reservoir(Reservoir::new(capacity)),
            Self::Sketch { alpha } => Estimator::Sketch(LogSketch::with_alpha(alpha)),
        }
    }

    /// Samples per entity that must be seen before fixed-capacity structures
    /// are full. Zero for strategies without a fill phase.
    pub fn warmup_samples(&self) -> u64 {
        match *self {
            Self::Reservoir { capacity } => capacity as u64,
            Self::Histogram { .. } | Self::Sketch { .. } => 0,
        }
    }

    /// Short human-readable description for frame headers.
    pub fn describe(&self) -> String {
        match *self {
            Self::Histogram { max_value } => format!("histogram 0..={max_value}"),
            Self::Reservoir { capacity } => format!("reservoir {capacity}"),
            Self::Sketch { alpha } => format!("DDSketch \u{3b1}={:.2}%", alpha * 100.0),
        }
    }
}

/// Position of the `q`-th order statistic among `count` sorted samples,
/// split into the lower rank and the interpolation fraction.
pub(crate) fn order_position(q: f64, count: u64) -> (u64, f64) {
    let q = if q.is_nan() { 0.0 } else { q.clamp(0.0, 1.0) };
    let pos = q * count.saturating_sub(1) as f64;
    let lower = pos.floor();
    (lower as u64, pos - lower)
}

#[inline]
pub(crate) fn interpolate(lo: f64, hi: f64, frac: f64) -> f64 {
    lo + (hi - lo) * frac
}
