use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ingest::batch::SampleBatch;
use crate::ingest::filter::EntityFilter;
use crate::state::AggregationState;
use crate::tracer::event::Sample;
use crate::tracer::stats::IngestStats;

/// Maximum samples pulled off the queue per wake-up. Each burst ends with a
/// flush, so one lock acquisition covers at most this many samples unless
/// the batch flushes earlier on its own.
const MAX_BURST: usize = 256;

/// Where the event loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Waiting on the queue.
    Idle,
    /// Termination observed; emptying what is already queued.
    Draining,
}

/// Consumer side of the event queue fed by a tracer.
pub struct EventDriver {
    rx: mpsc::Receiver<Sample>,
    state: Arc<AggregationState>,
    filter: EntityFilter,
    batch: SampleBatch,
    stats: Arc<IngestStats>,
    driver_state: DriverState,
}

impl EventDriver {
    pub fn new(
        rx: mpsc::Receiver<Sample>,
        state: Arc<AggregationState>,
        filter: EntityFilter,
        batch: SampleBatch,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            rx,
            state,
            filter,
            batch,
            stats,
            driver_state: DriverState::Idle,
        }
    }

    /// Runs until cancelled or until every sender is gone.
    ///
    /// Samples already in the queue when cancellation is observed are still
    /// aggregated, followed by one final flush.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.drain();
                    return;
                }

                maybe = self.rx.recv() => {
                    let Some(sample) = maybe else {
                        self.batch.flush(&self.state);
                        debug!("event queue closed");
                        return;
                    };

                    self.accept(sample);

                    // Drain up to MAX_BURST-1 more samples without blocking.
                    for _ in 0..MAX_BURST - 1 {
                        match self.rx.try_recv() {
                            Ok(sample) => self.accept(sample),
                            Err(_) => break,
                        }
                    }

                    if !self.batch.in_warmup() {
                        self.batch.flush(&self.state);
                    }
                }
            }
        }
    }

    fn drain(&mut self) {
        self.driver_state = DriverState::Draining;
        self.rx.close();

        let mut drained = 0u64;
        while let Ok(sample) = self.rx.try_recv() {
            self.accept(sample);
            drained += 1;
        }
        self.batch.flush(&self.state);

        info!(
            state = ?self.driver_state,
            drained,
            flushes = self.batch.flushes(),
            "event driver stopped"
        );
    }

    #[inline]
    fn accept(&mut self, sample: Sample) {
        if !self.filter.allows(sample.entity) {
            self.stats.record_filtered();
            return;
        }
        self.batch.push(sample, &self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Strategy;
    use crate::tracer::event::EntityKey;

    fn setup(
        capacity: usize,
        filter: EntityFilter,
    ) -> (
        mpsc::Sender<Sample>,
        EventDriver,
        Arc<AggregationState>,
        Arc<IngestStats>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::new(AggregationState::new(
            Strategy::histogram(255).expect("valid"),
        ));
        let stats = Arc::new(IngestStats::new());
        let driver = EventDriver::new(
            rx,
            Arc::clone(&state),
            filter,
            SampleBatch::new(1000, 0),
            Arc::clone(&stats),
        );
        (tx, driver, state, stats)
    }

    #[tokio::test]
    async fn test_closed_queue_flushes_and_exits() {
        let (tx, driver, state, _) = setup(16, EntityFilter::allow_all());
        for v in [1, 2, 3] {
            tx.send(Sample::new(EntityKey::Syscall(0), v))
                .await
                .expect("send");
        }
        drop(tx);

        driver.run(CancellationToken::new()).await;
        assert_eq!(state.total_count(), 3);
    }

    #[tokio::test]
    async fn test_cancel_drains_queued_samples() {
        let (tx, driver, state, _) = setup(64, EntityFilter::allow_all());
        for v in 0..50 {
            tx.send(Sample::new(EntityKey::Syscall(1), v))
                .await
                .expect("send");
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        driver.run(cancel).await;

        assert_eq!(state.total_count(), 50);
        // The receiver is closed once draining starts.
        assert!(tx.send(Sample::new(EntityKey::Syscall(1), 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_filter_counts_discards() {
        let keep = EntityKey::Syscall(0);
        let (tx, driver, state, stats) = setup(16, EntityFilter::allow_list([keep]));
        tx.send(Sample::new(keep, 5)).await.expect("send");
        tx.send(Sample::new(EntityKey::Syscall(9), 5))
            .await
            .expect("send");
        drop(tx);

        driver.run(CancellationToken::new()).await;

        let snap = state.snapshot();
        assert_eq!(snap.entities.len(), 1);
        assert_eq!(snap.total_count(), 1);
        assert_eq!(stats.totals().filtered, 1);
    }

    #[tokio::test]
    async fn test_runs_until_cancelled() {
        let (tx, driver, state, _) = setup(16, EntityFilter::allow_all());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(driver.run(cancel.clone()));

        tx.send(Sample::new(EntityKey::Syscall(2), 7))
            .await
            .expect("send");
        tokio::task::yield_now().await;

        cancel.cancel();
        handle.await.expect("driver task");
        assert_eq!(state.total_count(), 1);
    }
}
