//! Logarithmic-bucket mergeable sketch backed by `sketches_ddsketch`.
//!
//! The underlying DDSketch guarantees `|reported - v| <= a * v`. It is built
//! with `a = alpha / (1 + alpha)`, which tightens that to
//! `v / (1 + alpha) <= reported <= v * (1 + alpha)`.
//!
//! Zeros never reach the DDSketch; they are counted here and reported
//! exactly. The bucket limit is sized so every `u64` value gets its own key,
//! which is why accuracies below [`MIN_ALPHA`] are rejected.

use std::fmt;

use anyhow::{bail, Result};
use sketches_ddsketch::{Config as DDSketchConfig, DDSketch};

use super::QuantileEstimator;

/// Default relative accuracy (1%).
pub const DEFAULT_ALPHA: f64 = 0.01;

/// Smallest accepted relative accuracy (0.05%).
pub const MIN_ALPHA: f64 = 0.0005;

/// Hard cap on buckets per sketch.
const MAX_BINS: u32 = 1 << 16;

/// Lower edge of the indexed range; every positive integer sits above it.
const MIN_INDEXED: f64 = 0.5;

/// Rejects accuracies outside `[MIN_ALPHA, 1)`.
pub fn validate_alpha(alpha: f64) -> Result<()> {
    if !(alpha > 0.0 && alpha < 1.0) {
        bail!("relative accuracy must be in (0, 1), got {alpha}");
    }
    if alpha < MIN_ALPHA {
        bail!("relative accuracy must be at least {MIN_ALPHA}, got {alpha}");
    }
    Ok(())
}

pub struct LogSketch {
    alpha: f64,
    /// Accuracy handed to DDSketch.
    inner_alpha: f64,
    /// `ln(gamma)` of the inner mapping.
    ln_gamma: f64,
    max_bins: u32,
    inner: DDSketch,
    zero_count: u64,
    count: u64,
    min_positive: u64,
    max: u64,
}

impl LogSketch {
    /// Creates an empty sketch, validating `alpha`.
    pub fn new(alpha: f64) -> Result<Self> {
        validate_alpha(alpha)?;
        Ok(Self::with_alpha(alpha))
    }

    /// Creates an empty sketch for an already-validated `alpha`.
    pub(crate) fn with_alpha(alpha: f64) -> Self {
        let inner_alpha = alpha / (1.0 + alpha);
        let ln_gamma = (2.0 * inner_alpha / (1.0 - inner_alpha)).ln_1p();
        let span = ((u64::MAX as f64).ln() / ln_gamma).ceil() as u32;
        let max_bins = span.saturating_add(2).min(MAX_BINS);

        Self {
            alpha,
            inner_alpha,
            ln_gamma,
            max_bins,
            inner: new_inner(inner_alpha, max_bins),
            zero_count: 0,
            count: 0,
            min_positive: u64::MAX,
            max: 0,
        }
    }

    /// Relative accuracy this sketch was built with.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Number of buckets spanned by the observed non-zero values.
    pub fn bucket_count(&self) -> usize {
        if self.max == 0 {
            return 0;
        }
        let span = self.key_of(self.max) - self.key_of(self.min_positive) + 1;
        usize::try_from(span).unwrap_or(0)
    }

    /// Approximate heap footprint of the bucket store.
    pub fn memory_bytes(&self) -> usize {
        self.bucket_count() * std::mem::size_of::<u64>()
    }

    /// Adds every sample of `other` into `self`; `other` is left untouched.
    /// Both sketches must share the same accuracy.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if self.inner_alpha != other.inner_alpha || self.max_bins != other.max_bins {
            bail!(
                "cannot merge sketches with different accuracy ({} vs {})",
                self.alpha,
                other.alpha
            );
        }
        if self.inner.merge(&other.inner).is_err() {
            bail!("sketch configurations do not match");
        }
        self.zero_count += other.zero_count;
        self.count += other.count;
        self.min_positive = self.min_positive.min(other.min_positive);
        self.max = self.max.max(other.max);
        Ok(())
    }

    #[inline]
    fn key_of(&self, value: u64) -> i64 {
        ((value as f64).ln() / self.ln_gamma).ceil() as i64
    }

    fn empty_like(&self) -> Self {
        Self {
            inner: new_inner(self.inner_alpha, self.max_bins),
            zero_count: 0,
            count: 0,
            min_positive: u64::MAX,
            max: 0,
            ..*self
        }
    }
}

fn new_inner(inner_alpha: f64, max_bins: u32) -> DDSketch {
    DDSketch::new(DDSketchConfig::new(inner_alpha, max_bins, MIN_INDEXED))
}

impl Clone for LogSketch {
    fn clone(&self) -> Self {
        let mut copy = self.empty_like();
        // Same configuration on both sides, so the merge cannot be rejected.
        let _ = copy.inner.merge(&self.inner);
        copy.zero_count = self.zero_count;
        copy.count = self.count;
        copy.min_positive = self.min_positive;
        copy.max = self.max;
        copy
    }
}

impl fmt::Debug for LogSketch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSketch")
            .field("alpha", &self.alpha)
            .field("count", &self.count)
            .field("zero_count", &self.zero_count)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

impl QuantileEstimator for LogSketch {
    #[inline]
    fn insert(&mut self, value: u64) {
        self.count += 1;
        if value == 0 {
            self.zero_count += 1;
            return;
        }
        self.inner.add(value as f64);
        self.min_positive = self.min_positive.min(value);
        self.max = self.max.max(value);
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = if q.is_nan() { 0.0 } else { q.clamp(0.0, 1.0) };
        let rank = (q * (self.count - 1) as f64).floor() as u64;
        if rank < self.zero_count {
            return Some(0.0);
        }

        // Extremes are tracked exactly.
        let positive = self.count - self.zero_count;
        let rank = rank - self.zero_count;
        if rank == 0 {
            return Some(self.min_positive as f64);
        }
        if rank + 1 >= positive {
            return Some(self.max as f64);
        }

        // Re-target the rank at the non-zero samples held by DDSketch, which
        // picks the element at floor(q' * (n - 1)).
        let inner_q = (rank as f64 + 0.5) / (positive - 1) as f64;
        self.inner.quantile(inner_q).ok().flatten()
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        *self = self.empty_like();
    }

    fn snapshot(&self) -> Self {
        self.clone()
    }
}
