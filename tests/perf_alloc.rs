use std::alloc::System;
use std::hint::black_box;
use std::time::Instant;

use latscope::device::DeviceId;
use latscope::estimator::histogram::ExactHistogram;
use latscope::estimator::reservoir::Reservoir;
use latscope::estimator::sketch::LogSketch;
use latscope::estimator::{QuantileEstimator, Strategy};
use latscope::ingest::SampleBatch;
use latscope::state::AggregationState;
use latscope::tracer::event::{EntityKey, Sample, RECORD_SIZE};
use latscope::tracer::parse::parse_record;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn record_bytes(key: u32, elapsed_ns: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    buf.extend_from_slice(&key.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&elapsed_ns.to_le_bytes());
    buf
}

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn device_keys(n: u32) -> Vec<EntityKey> {
    (0..n)
        .map(|i| EntityKey::Device(DeviceId::new(8, i * 16)))
        .collect()
}

#[test]
#[serial]
fn parse_record_allocates_zero() {
    let data = record_bytes(17, 2_500_000);

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..1_024 {
            black_box(parse_record(black_box(&data)).expect("parse record"));
        }
    });

    assert_eq!(allocations, 0, "parse allocated {allocations} times");
    assert_eq!(deallocations, 0);
}

#[test]
#[serial]
fn warmed_sketch_insert_allocates_zero() {
    let mut sketch = LogSketch::new(0.01).expect("valid alpha");
    // Cover the full range once so every bucket exists.
    for v in 1..=100_000u64 {
        sketch.insert(v);
    }

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..10_000u64 {
            sketch.insert(black_box(1 + (i * 37) % 100_000));
        }
    });

    assert_eq!(allocations, 0, "sketch insert allocated {allocations} times");
}

#[test]
#[serial]
fn histogram_insert_allocates_zero() {
    let mut hist = ExactHistogram::new(255);

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..10_000u64 {
            // Includes values above the clamp.
            hist.insert(black_box(i % 400));
        }
    });

    assert_eq!(allocations, 0, "histogram insert allocated {allocations} times");
    assert_eq!(hist.count(), 10_000);
}

#[test]
#[serial]
fn full_reservoir_insert_allocates_zero() {
    let mut reservoir = Reservoir::with_seed(512, 7);
    for v in 0..512u64 {
        reservoir.insert(v);
    }
    assert!(reservoir.is_full());

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..10_000u64 {
            reservoir.insert(black_box(i));
        }
    });

    assert_eq!(allocations, 0, "reservoir insert allocated {allocations} times");
}

#[test]
#[serial]
fn record_batch_on_known_entities_allocates_zero() {
    let state = AggregationState::new(Strategy::histogram(255).expect("valid"));
    let keys = device_keys(8);
    for &key in &keys {
        state.register(key);
    }

    let now = Instant::now();
    let samples: Vec<Sample> = (0..1_000u64)
        .map(|i| Sample {
            entity: keys[(i % 8) as usize],
            value: i % 64,
            observed_at: now,
        })
        .collect();

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..16 {
            state.record_batch(black_box(&samples));
        }
    });

    assert_eq!(allocations, 0, "record_batch allocated {allocations} times");
    assert_eq!(deallocations, 0);
    assert_eq!(state.total_count(), 16_000);
}

#[test]
#[serial]
fn sample_batch_steady_state_allocation_budget() {
    let state = AggregationState::new(Strategy::sketch(0.01).expect("valid"));
    let keys = device_keys(4);
    let mut batch = SampleBatch::new(1_000, 0);

    // First pass creates accumulators and grows sketch buckets.
    for i in 0..4_000u64 {
        batch.push(Sample::new(keys[(i % 4) as usize], 1 + i % 500), &state);
    }
    batch.flush(&state);

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..4_000u64 {
            batch.push(Sample::new(keys[(i % 4) as usize], 1 + i % 500), &state);
        }
        batch.flush(&state);
    });

    assert!(
        allocations <= 4,
        "steady-state batching allocation budget exceeded: {}",
        allocations
    );
}
