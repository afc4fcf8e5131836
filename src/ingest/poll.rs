//! Poll-driven ingestion from per-device `inflight` counters.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::ingest::batch::SampleBatch;
use crate::ingest::filter::EntityFilter;
use crate::state::{AggregationState, CurrentValues};
use crate::tracer::event::{EntityKey, Sample};

/// Pre-opened handle to one `inflight` attribute.
///
/// The file stays open for the life of the driver; every read is a single
/// positional read from offset zero, which makes sysfs regenerate the
/// attribute.
pub struct InflightReader {
    file: File,
    path: PathBuf,
    buf: [u8; 64],
}

impl InflightReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            file,
            path,
            buf: [0; 64],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current depth. Unreadable or malformed content reads as 0.
    #[inline]
    pub fn read(&mut self) -> u64 {
        match self.file.read_at(&mut self.buf, 0) {
            Ok(n) => parse_inflight(&self.buf[..n]),
            Err(e) => {
                trace!(path = %self.path.display(), error = %e, "inflight read failed");
                0
            }
        }
    }
}

/// Sums the two whitespace-separated counters of an `inflight` attribute.
/// Anything other than exactly two non-negative integers yields 0.
pub fn parse_inflight(raw: &[u8]) -> u64 {
    let Ok(text) = std::str::from_utf8(raw) else {
        return 0;
    };
    let mut fields = text.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(reads)), Some(Ok(writes)), None) => reads.saturating_add(writes),
        _ => 0,
    }
}

/// One polled entity.
pub struct PolledSource {
    pub key: EntityKey,
    pub reader: InflightReader,
}

/// A named set of sources whose depths are summed into their own entity.
#[derive(Debug, Clone)]
pub struct PollGroup {
    pub key: EntityKey,
    /// Indices into the driver's source list.
    pub members: Vec<usize>,
}

/// Reads every source each iteration, publishes current values and feeds
/// the aggregation state.
pub struct PollDriver {
    sources: Vec<PolledSource>,
    groups: Vec<PollGroup>,
    current: Arc<CurrentValues>,
    state: Arc<AggregationState>,
    filter: EntityFilter,
    scratch: Vec<Sample>,
}

impl PollDriver {
    /// Builds a driver. Current-value slots follow the source order, then
    /// the group order.
    pub fn new(
        sources: Vec<PolledSource>,
        groups: Vec<PollGroup>,
        state: Arc<AggregationState>,
        filter: EntityFilter,
    ) -> Self {
        let keys: Vec<EntityKey> = sources
            .iter()
            .map(|s| s.key)
            .chain(groups.iter().map(|g| g.key))
            .collect();
        for &key in &keys {
            state.register(key);
        }
        let scratch = Vec::with_capacity(keys.len());
        Self {
            sources,
            groups,
            current: Arc::new(CurrentValues::new(keys)),
            state,
            filter,
            scratch,
        }
    }

    /// Cells the renderer reads for the "current" column.
    pub fn current_values(&self) -> Arc<CurrentValues> {
        Arc::clone(&self.current)
    }

    pub fn entity_count(&self) -> usize {
        self.sources.len() + self.groups.len()
    }

    /// Reads every source once and returns the resulting samples.
    pub fn poll_once(&mut self) -> &[Sample] {
        let now = Instant::now();
        self.scratch.clear();

        for (slot, source) in self.sources.iter_mut().enumerate() {
            let depth = source.reader.read();
            self.current.store(slot, depth);
            if self.filter.allows(source.key) {
                self.scratch.push(Sample {
                    entity: source.key,
                    value: depth,
                    observed_at: now,
                });
            }
        }

        let base = self.sources.len();
        for (i, group) in self.groups.iter().enumerate() {
            let depth: u64 = group
                .members
                .iter()
                .filter_map(|&m| self.current.load(m))
                .sum();
            self.current.store(base + i, depth);
            if self.filter.allows(group.key) {
                self.scratch.push(Sample {
                    entity: group.key,
                    value: depth,
                    observed_at: now,
                });
            }
        }

        &self.scratch
    }

    /// Tight loop with no delay between iterations, flushing through
    /// `batch`. Blocks the calling thread; run it on a blocking task.
    pub fn run_unthrottled(mut self, mut batch: SampleBatch, cancel: CancellationToken) -> u64 {
        let state = Arc::clone(&self.state);
        let mut iterations = 0u64;

        while !cancel.is_cancelled() {
            for &sample in self.poll_once() {
                batch.push(sample, &state);
            }
            iterations += 1;
        }
        batch.flush(&state);

        info!(iterations, flushes = batch.flushes(), "poll driver stopped");
        iterations
    }

    /// Polls once per `period`, recording each sample under its own lock
    /// acquisition.
    pub async fn run_every(mut self, period: Duration, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let state = Arc::clone(&self.state);
        let mut iterations = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for sample in self.poll_once() {
                        state.record(sample.entity, sample.value);
                    }
                    iterations += 1;
                }
            }
        }

        debug!(iterations, period = ?period, "poll driver stopped");
        iterations
    }
}
