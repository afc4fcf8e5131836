use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters describing what happened at the ingestion boundary.
///
/// Lifetime totals are read with [`IngestStats::totals`]; the renderer uses
/// [`IngestStats::take_dropped`] to report drops since the previous frame.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    parse_errors: AtomicU64,
    dropped_unreported: AtomicU64,
}

/// Plain copy of [`IngestStats`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestTotals {
    pub received: u64,
    pub dropped: u64,
    pub filtered: u64,
    pub parse_errors: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sample was handed to the consumer queue.
    #[inline]
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// A sample was lost because the consumer queue was full.
    #[inline]
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.dropped_unreported.fetch_add(1, Ordering::Relaxed);
    }

    /// A sample was discarded by the entity allow-list.
    #[inline]
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> IngestTotals {
        IngestTotals {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    /// Atomically reads and clears the drops not yet reported.
    pub fn take_dropped(&self) -> u64 {
        self.dropped_unreported.swap(0, Ordering::Relaxed)
    }
}
