pub mod correlator;
pub mod event;
pub mod parse;
pub mod stats;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use self::event::{LatencyRecord, Sample, SourceKind};
use self::stats::IngestStats;

/// Default kernel ring buffer size in bytes.
pub const DEFAULT_RING_BUFFER_SIZE: u32 = 8 * 1024 * 1024;

/// Callback for tracer errors.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// What to attach and how to pre-filter in the kernel.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub kind: SourceKind,
    pub ring_buffer_size: u32,
    /// Raw entity keys to keep; empty disables in-kernel filtering.
    pub entity_filter: Vec<u32>,
    /// Only trace tasks with this comm (syscall source only).
    pub process_name: Option<String>,
}

/// Producer half of the bounded event queue.
///
/// Delivery never blocks: when the consumer falls behind, the newest sample
/// is dropped and counted.
#[derive(Clone)]
pub struct SampleSender {
    kind: SourceKind,
    tx: mpsc::Sender<Sample>,
    stats: Arc<IngestStats>,
}

impl SampleSender {
    pub fn new(kind: SourceKind, tx: mpsc::Sender<Sample>, stats: Arc<IngestStats>) -> Self {
        Self { kind, tx, stats }
    }

    /// Converts a decoded record and offers it to the queue.
    /// Returns false once the consumer has gone away.
    #[inline]
    pub fn deliver(&self, record: LatencyRecord, now: Instant) -> bool {
        self.offer(record.into_sample(self.kind, now))
    }

    #[inline]
    pub fn offer(&self, sample: Sample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => {
                self.stats.record_received();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped();
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }
}

/// Tracer manages BPF program loading, attachment, and record delivery.
pub trait Tracer: Send {
    /// Load programs, program the filter maps, attach, start the reader.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop the reader and detach all programs.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for errors raised by the reader task.
    fn on_error(&mut self, handler: ErrorHandler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::EntityKey;

    #[tokio::test]
    async fn test_sender_drops_newest_when_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let stats = Arc::new(IngestStats::new());
        let sender = SampleSender::new(SourceKind::Syscall, tx, Arc::clone(&stats));

        let now = Instant::now();
        for key in 0..4u32 {
            let rec = LatencyRecord {
                entity_key: key,
                elapsed_ns: 5_000,
            };
            assert!(sender.deliver(rec, now));
        }

        let totals = stats.totals();
        assert_eq!(totals.received, 2);
        assert_eq!(totals.dropped, 2);

        let first = rx.recv().await.expect("first");
        let second = rx.recv().await.expect("second");
        assert_eq!(first.entity, EntityKey::Syscall(0));
        assert_eq!(second.entity, EntityKey::Syscall(1));
        assert_eq!(first.value, 5);
    }

    #[tokio::test]
    async fn test_sender_reports_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        let sender = SampleSender::new(SourceKind::Block, tx, Arc::new(IngestStats::new()));
        drop(rx);
        assert!(!sender.offer(Sample::new(EntityKey::Syscall(0), 1)));
    }
}
