use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use latscope::agent::Agent;
use latscope::config::{Config, GroupConfig, Mode, StrategyKind};
use latscope::device::{DeviceId, Resolver, Sysfs};
use latscope::estimator::Strategy;
use latscope::ingest::{EntityFilter, EventDriver, SampleBatch};
use latscope::render::{RenderOptions, Renderer, View};
use latscope::state::AggregationState;
use latscope::tracer::event::{EntityKey, Sample, SourceKind, RECORD_SIZE};
use latscope::tracer::correlator::Correlator;
use latscope::tracer::parse::{parse_record, parse_records};
use latscope::tracer::stats::IngestStats;
use latscope::tracer::SampleSender;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn record(key: u32, elapsed_ns: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    buf.extend_from_slice(&key.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&elapsed_ns.to_le_bytes());
    buf
}

fn add_device(root: &Path, name: &str, major: u32, minor: u32, inflight: &str) {
    let block = root.join("block").join(name);
    fs::create_dir_all(&block).expect("create block dir");
    fs::write(
        block.join("uevent"),
        format!("MAJOR={major}\nMINOR={minor}\nDEVNAME={name}\n"),
    )
    .expect("write uevent");
    fs::write(block.join("inflight"), inflight).expect("write inflight");

    let dev = root.join("dev/block").join(format!("{major}:{minor}"));
    fs::create_dir_all(&dev).expect("create dev dir");
    fs::write(dev.join("uevent"), format!("DEVNAME={name}\n")).expect("write dev uevent");
}

/// Clonable in-memory frame sink.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

#[test]
fn test_known_sequence_end_to_end() {
    let state = Arc::new(AggregationState::new(
        Strategy::histogram(255).expect("valid"),
    ));
    let sdc = EntityKey::Device(DeviceId::new(8, 32));
    let mut batch = SampleBatch::new(1000, 0);
    for v in [0, 0, 0, 5, 5, 10, 30] {
        batch.push(Sample::new(sdc, v), &state);
    }
    batch.flush(&state);

    let snap = state.snapshot();
    let entity = snap.get(sdc).expect("entity");
    let exact = entity.lifetime.exact;
    assert_eq!(exact.count, 7);
    assert_eq!(exact.nonzero, 4);
    assert_eq!(exact.max, 30);
    let util = exact.utilization().expect("util");
    assert!((util - 4.0 / 7.0).abs() < 1e-9);
    let mean = exact.mean().expect("mean");
    assert!((mean - 50.0 / 7.0).abs() < 1e-9);
    assert_eq!(entity.lifetime.quantile(0.5), Some(5.0));

    let resolver = Arc::new(Resolver::new(Sysfs::new("/nonexistent"), Vec::new()));
    resolver.insert(sdc, "sdc");
    let mut renderer = Renderer::new(
        Vec::new(),
        RenderOptions {
            title: "Block I/O Queue Monitor".into(),
            view: View::Queue,
            percentiles: vec![50.0, 99.0],
            show_top: false,
            batch: true,
            interval: Duration::from_secs(10),
            strategy: state.strategy().describe(),
            bar_width: 30,
            full_scale: Default::default(),
        },
        Arc::clone(&state),
        resolver,
        Arc::new(IngestStats::new()),
    );
    let frame = renderer.build_frame(&snap).to_string();
    let row = frame
        .lines()
        .find(|l| l.starts_with("sdc"))
        .expect("sdc row");
    assert!(row.contains("57.1%"), "{row}");
    assert!(row.contains("5.00"), "{row}");
    assert!(row.contains("7.14"), "{row}");
}

#[tokio::test]
async fn test_records_through_event_driver() {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let stats = Arc::new(IngestStats::new());
    let sender = SampleSender::new(SourceKind::Syscall, tx, Arc::clone(&stats));
    let state = Arc::new(AggregationState::new(Strategy::sketch(0.01).expect("valid")));

    let mut wire = Vec::new();
    wire.extend(record(17, 500)); // sub-microsecond, clamped to 1µs
    wire.extend(record(17, 2_000_000));
    wire.extend(record(74, 40_000));
    wire.extend(record(1, 9_000)); // not in the allow-list

    let now = Instant::now();
    for rec in parse_records(&wire) {
        assert!(sender.deliver(rec.expect("valid record"), now));
    }
    drop(sender);

    let filter = EntityFilter::allow_list([EntityKey::Syscall(17), EntityKey::Syscall(74)]);
    let driver = EventDriver::new(
        rx,
        Arc::clone(&state),
        filter,
        SampleBatch::new(1000, 0),
        Arc::clone(&stats),
    );
    driver.run(CancellationToken::new()).await;

    let snap = state.snapshot();
    let pread = snap.get(EntityKey::Syscall(17)).expect("pread64");
    assert_eq!(pread.lifetime.exact.count, 2);
    assert_eq!(pread.lifetime.exact.min(), 1);
    assert_eq!(pread.true_max, 2_000);
    assert!(snap.get(EntityKey::Syscall(1)).is_none());

    let totals = stats.totals();
    assert_eq!(totals.received, 4);
    assert_eq!(totals.filtered, 1);
    assert_eq!(totals.dropped, 0);
}

#[tokio::test]
async fn test_correlated_completions_feed_state() {
    let sda = EntityKey::Device(DeviceId::new(8, 0));
    let mut table = Correlator::new(2);

    assert!(table.on_issue(1, sda, 1_000));
    assert!(table.on_issue(2, sda, 2_000));
    // Table full: this issue is lost and so is its completion.
    assert!(!table.on_issue(3, sda, 2_500));

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let stats = Arc::new(IngestStats::new());
    let sender = SampleSender::new(SourceKind::Block, tx, Arc::clone(&stats));

    let now = Instant::now();
    for (op, ts) in [(2, 52_000), (3, 60_000), (1, 9_001_000), (9, 9_500_000)] {
        if let Some(done) = table.on_complete(op, ts) {
            let raw = done.entity.device().expect("device entity").raw();
            let rec = parse_record(&record(raw, done.elapsed_ns)).expect("valid record");
            assert!(sender.deliver(rec, now));
        }
    }
    drop(sender);
    assert_eq!(table.in_flight(), 0);

    let state = Arc::new(AggregationState::new(Strategy::histogram(50_000).expect("valid")));
    let driver = EventDriver::new(
        rx,
        Arc::clone(&state),
        EntityFilter::allow_all(),
        SampleBatch::new(1000, 0),
        Arc::clone(&stats),
    );
    driver.run(CancellationToken::new()).await;

    let snap = state.snapshot();
    let entity = snap.get(sda).expect("sda");
    assert_eq!(entity.lifetime.exact.count, 2);
    assert_eq!(entity.lifetime.exact.min(), 50);
    assert_eq!(entity.true_max, 9_000);
    assert_eq!(stats.totals().received, 2);
}

#[test]
fn test_truncated_wire_data_is_reported() {
    let mut wire = record(1, 1_000);
    wire.extend_from_slice(&[0u8; 5]);
    let results: Vec<_> = parse_records(&wire).collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}

#[test]
fn test_batched_flush_equivalence() {
    const K: u64 = 997;
    let keys = [
        EntityKey::Device(DeviceId::new(8, 0)),
        EntityKey::Device(DeviceId::new(8, 16)),
        EntityKey::Syscall(3),
    ];
    // Deterministic spread including zeros.
    let samples: Vec<Sample> = (0..K)
        .map(|i| Sample::new(keys[(i % 3) as usize], (i * 7919) % 301))
        .collect();

    let reference = AggregationState::new(Strategy::histogram(255).expect("valid"));
    for s in &samples {
        reference.record(s.entity, s.value);
    }
    let expected = reference.snapshot();

    for batch_size in [1usize, 2, 7, 100, 500, K as usize] {
        let state = AggregationState::new(Strategy::histogram(255).expect("valid"));
        let mut batch = SampleBatch::new(batch_size, 0);
        for s in &samples {
            batch.push(*s, &state);
        }
        batch.flush(&state);

        let got = state.snapshot();
        assert_eq!(got.entities.len(), expected.entities.len());
        for ((k1, a), (k2, b)) in got.entities.iter().zip(&expected.entities) {
            assert_eq!(k1, k2);
            assert_eq!(a.lifetime.exact, b.lifetime.exact, "batch size {batch_size}");
            assert_eq!(a.interval.exact, b.interval.exact, "batch size {batch_size}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_mode_agent_against_fake_sysfs() {
    let dir = tempfile::tempdir().expect("tempdir");
    add_device(dir.path(), "sda", 8, 0, "1 2\n");
    add_device(dir.path(), "sdb", 8, 16, "0 0\n");
    add_device(dir.path(), "loop0", 7, 0, "5 5\n");

    let cfg = Config {
        mode: Mode::Queue,
        sysfs_root: dir.path().to_path_buf(),
        poll_interval: Some(Duration::from_millis(2)),
        frame_interval: Some(Duration::from_millis(10)),
        batch: true,
        groups: vec![GroupConfig {
            name: "all".into(),
            members: vec!["sda".into(), "sdb".into()],
        }],
        ..Default::default()
    };

    let out = SharedBuf::default();
    let mut agent = Agent::with_output(cfg, Box::new(out.clone())).expect("agent");
    agent.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(60)).await;
    agent.stop().await.expect("stop");

    let snap = agent.state().snapshot();
    // sda, sdb and the group; loop0 does not match the tracked prefixes.
    assert_eq!(snap.entities.len(), 3);
    let sda = snap.get(EntityKey::Device(DeviceId::new(8, 0))).expect("sda");
    assert!(sda.lifetime.exact.count > 0);
    assert_eq!(sda.true_max, 3);
    let group = snap.get(EntityKey::Group(0)).expect("group");
    assert_eq!(group.true_max, 3);

    let text = out.text();
    assert!(text.contains("Block I/O Queue Monitor"));
    assert!(text.contains("sda"));
    assert!(text.contains("all"));
    assert!(!text.contains("loop0"));
    assert!(!text.contains("\x1b[H"), "batch mode never clears");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unthrottled_queue_mode_with_device_filter() {
    let dir = tempfile::tempdir().expect("tempdir");
    add_device(dir.path(), "sdc", 8, 32, "0 4\n");
    add_device(dir.path(), "sdd", 8, 48, "0 0\n");

    let cfg = Config {
        mode: Mode::Queue,
        devices: "sdc".into(),
        sysfs_root: dir.path().to_path_buf(),
        strategy: Some(StrategyKind::Reservoir),
        reservoir_size: 16,
        flush_every: 8,
        frame_interval: Some(Duration::from_millis(10)),
        batch: true,
        ..Default::default()
    };

    let out = SharedBuf::default();
    let mut agent = Agent::with_output(cfg, Box::new(out.clone())).expect("agent");
    agent.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(30)).await;
    agent.stop().await.expect("stop");

    let snap = agent.state().snapshot();
    assert_eq!(snap.entities.len(), 1);
    let sdc = snap.get(EntityKey::Device(DeviceId::new(8, 32))).expect("sdc");
    assert!(sdc.lifetime.exact.count > 0);
    assert_eq!(sdc.lifetime.quantile(0.5), Some(4.0));
    assert!(out.text().contains("sdc"));
}

#[test]
fn test_invalid_alpha_is_fatal() {
    let cfg = Config {
        alpha: 1.0,
        ..Default::default()
    };
    let err = Agent::with_output(cfg, Box::new(SharedBuf::default()))
        .err()
        .expect("invalid alpha rejected");
    assert!(format!("{err:#}").contains("relative accuracy"));
}

#[tokio::test]
async fn test_unknown_device_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = Config {
        mode: Mode::Queue,
        devices: "sdz".into(),
        sysfs_root: dir.path().to_path_buf(),
        ..Default::default()
    };
    let mut agent = Agent::with_output(cfg, Box::new(SharedBuf::default())).expect("agent");
    let err = agent.start().await.expect_err("missing device");
    assert!(format!("{err:#}").contains("sdz"));
}

#[cfg(not(feature = "bpf"))]
#[tokio::test]
async fn test_latency_mode_requires_bpf_feature() {
    let cfg = Config {
        mode: Mode::Syscall,
        ..Default::default()
    };
    let mut agent = Agent::with_output(cfg, Box::new(SharedBuf::default())).expect("agent");
    let err = agent.start().await.expect_err("no tracer");
    assert!(format!("{err:#}").contains("bpf"));
}
