use crate::state::AggregationState;
use crate::tracer::event::Sample;

/// Default number of samples buffered between flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 1000;

/// Task-local sample buffer flushed into [`AggregationState`] in bulk.
///
/// While `warmup_remaining` is non-zero every sample is flushed on its own,
/// so fixed-capacity estimators fill at full resolution and the first frames
/// are not stale. Afterwards samples are flushed once `flush_every` are
/// pending, taking the state's write lock once per flush.
pub struct SampleBatch {
    buf: Vec<Sample>,
    flush_every: usize,
    warmup_remaining: u64,
    flushes: u64,
}

impl SampleBatch {
    pub fn new(flush_every: usize, warmup_samples: u64) -> Self {
        let flush_every = flush_every.max(1);
        Self {
            buf: Vec::with_capacity(flush_every),
            flush_every,
            warmup_remaining: warmup_samples,
            flushes: 0,
        }
    }

    /// Buffers a sample and flushes if the policy calls for it.
    /// Returns true when a flush happened.
    #[inline]
    pub fn push(&mut self, sample: Sample, state: &AggregationState) -> bool {
        self.buf.push(sample);
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            self.flush(state);
            return true;
        }
        if self.buf.len() >= self.flush_every {
            self.flush(state);
            return true;
        }
        false
    }

    /// Applies all pending samples under one lock acquisition.
    pub fn flush(&mut self, state: &AggregationState) {
        if self.buf.is_empty() {
            return;
        }
        state.record_batch(&self.buf);
        self.buf.clear();
        self.flushes += 1;
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn in_warmup(&self) -> bool {
        self.warmup_remaining > 0
    }

    /// Number of flushes that touched the shared state.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}
