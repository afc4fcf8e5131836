use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, Mode};
use crate::device::{parse_device_filter, syscalls, Resolver, SelectedDevice, Sysfs};
use crate::estimator::Strategy;
use crate::ingest::{EntityFilter, InflightReader, PollDriver, PollGroup, PolledSource, SampleBatch};
use crate::render::{RenderOptions, Renderer, View};
use crate::state::{AggregationState, CurrentValues};
use crate::tracer::event::{EntityKey, SourceKind};
use crate::tracer::stats::IngestStats;

#[cfg(feature = "bpf")]
use crate::ingest::EventDriver;
#[cfg(feature = "bpf")]
use crate::tracer::bpf::BpfTracer;
#[cfg(feature = "bpf")]
use crate::tracer::{SampleSender, Tracer, TracerConfig};

/// Frame destination.
pub type Output = Box<dyn Write + Send>;

/// What a latency source traces and what ingestion keeps.
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
struct LatencyTargets {
    kind: SourceKind,
    /// Raw keys programmed into the in-kernel filter; empty traces all.
    raw_keys: Vec<u32>,
    filter: EntityFilter,
}

/// Agent wires the source, aggregation state, reset ticker and renderer
/// together and owns their shutdown order.
pub struct Agent {
    cfg: Config,
    strategy: Strategy,
    state: Arc<AggregationState>,
    resolver: Arc<Resolver>,
    sysfs: Sysfs,
    stats: Arc<IngestStats>,
    output: Option<Output>,
    ingest_tasks: Vec<JoinHandle<()>>,
    render_task: Option<JoinHandle<()>>,
    #[cfg(feature = "bpf")]
    tracer: Option<BpfTracer>,
    ingest_cancel: CancellationToken,
    render_cancel: CancellationToken,
}

impl Agent {
    /// Creates an agent that renders to stdout.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_output(cfg, Box::new(std::io::stdout()))
    }

    /// Creates an agent that renders to `output`.
    pub fn with_output(cfg: Config, output: Output) -> Result<Self> {
        cfg.validate().context("validating config")?;
        let strategy = cfg.strategy()?;

        let sysfs = Sysfs::new(&cfg.sysfs_root);
        let group_names = cfg.groups.iter().map(|g| g.name.clone()).collect();
        let resolver = Arc::new(Resolver::new(sysfs.clone(), group_names));

        Ok(Self {
            strategy,
            state: Arc::new(AggregationState::new(strategy)),
            resolver,
            sysfs,
            stats: Arc::new(IngestStats::new()),
            output: Some(output),
            ingest_tasks: Vec::with_capacity(2),
            render_task: None,
            #[cfg(feature = "bpf")]
            tracer: None,
            ingest_cancel: CancellationToken::new(),
            render_cancel: CancellationToken::new(),
            cfg,
        })
    }

    pub fn state(&self) -> &Arc<AggregationState> {
        &self.state
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Start ingestion, interval resets and rendering.
    pub async fn start(&mut self) -> Result<()> {
        let mut full_scale = HashMap::new();

        let current = match self.cfg.mode {
            Mode::Block | Mode::Syscall => {
                let targets = self.latency_targets()?;
                self.start_tracing(targets).await?;
                None
            }
            Mode::Queue => Some(self.start_polling(&mut full_scale)?),
        };

        self.spawn_interval_reset();
        self.spawn_renderer(current, full_scale)?;

        info!(
            mode = ?self.cfg.mode,
            strategy = %self.strategy.describe(),
            interval = ?self.cfg.interval,
            frame_interval = ?self.cfg.frame_interval(),
            "agent started"
        );
        Ok(())
    }

    /// Stop ingestion, then let the renderer draw its final frame.
    pub async fn stop(&mut self) -> Result<()> {
        self.ingest_cancel.cancel();

        for handle in self.ingest_tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "ingestion task failed");
            }
        }

        #[cfg(feature = "bpf")]
        if let Some(tracer) = &mut self.tracer {
            if let Err(e) = tracer.stop().await {
                error!(error = %e, "error stopping tracer");
            }
        }

        self.render_cancel.cancel();
        if let Some(handle) = self.render_task.take() {
            handle.await.context("waiting for renderer")?;
        }

        let totals = self.stats.totals();
        info!(
            samples = self.state.total_count(),
            entities = self.state.entity_count(),
            dropped = totals.dropped,
            filtered = totals.filtered,
            parse_errors = totals.parse_errors,
            "agent stopped"
        );
        Ok(())
    }

    /// Resolves the entity filter for a latency mode.
    fn latency_targets(&self) -> Result<LatencyTargets> {
        match self.cfg.mode {
            Mode::Block => {
                let selected = parse_device_filter(&self.cfg.devices, &self.sysfs)
                    .context("parsing device filter")?;
                for dev in &selected {
                    self.seed_name(dev);
                }
                let keys: Vec<EntityKey> =
                    selected.iter().map(|d| EntityKey::Device(d.id)).collect();
                let mut filter = EntityFilter::allow_list(keys.iter().copied());
                if !keys.is_empty() {
                    info!(devices = keys.len(), "filtering devices");
                } else if !self.cfg.device_prefixes.is_empty() {
                    let tracked = self
                        .sysfs
                        .tracked_devices(&self.cfg.device_prefixes)
                        .context("resolving tracked devices")?;
                    for dev in &tracked {
                        self.seed_name(dev);
                    }
                    debug!(devices = tracked.len(), "tracking devices by prefix");
                    filter = filter.with_tracked_devices(tracked.iter().map(|d| d.id));
                }

                Ok(LatencyTargets {
                    kind: SourceKind::Block,
                    raw_keys: selected.iter().map(|d| d.id.raw()).collect(),
                    filter,
                })
            }
            Mode::Syscall => {
                let numbers = syscalls::parse_list(&self.cfg.syscalls)?;
                Ok(LatencyTargets {
                    kind: SourceKind::Syscall,
                    raw_keys: numbers.clone(),
                    filter: EntityFilter::allow_list(numbers.into_iter().map(EntityKey::Syscall)),
                })
            }
            Mode::Queue => bail!("queue mode has no latency source"),
        }
    }

    #[cfg(feature = "bpf")]
    async fn start_tracing(&mut self, targets: LatencyTargets) -> Result<()> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.cfg.event_queue_capacity);
        let sender = SampleSender::new(targets.kind, tx, Arc::clone(&self.stats));

        let mut tracer = BpfTracer::new(
            TracerConfig {
                kind: targets.kind,
                ring_buffer_size: self.cfg.ring_buffer_size,
                entity_filter: targets.raw_keys,
                process_name: self.cfg.process_name.clone(),
            },
            sender,
        );
        tracer.on_error(Box::new(|e| {
            tracing::warn!(error = %e, "tracer error");
        }));
        tracer
            .start(self.ingest_cancel.clone())
            .await
            .context("starting tracer")?;
        self.tracer = Some(tracer);

        let driver = EventDriver::new(
            rx,
            Arc::clone(&self.state),
            targets.filter,
            SampleBatch::new(self.cfg.flush_every, 0),
            Arc::clone(&self.stats),
        );
        let cancel = self.ingest_cancel.clone();
        self.ingest_tasks.push(tokio::spawn(driver.run(cancel)));
        Ok(())
    }

    #[cfg(not(feature = "bpf"))]
    async fn start_tracing(&mut self, targets: LatencyTargets) -> Result<()> {
        bail!(
            "{} latency tracing requires building with the `bpf` feature ({} filtered entities)",
            targets.kind,
            targets.raw_keys.len()
        );
    }

    /// Opens every polled device and spawns the poll driver.
    fn start_polling(&mut self, full_scale: &mut HashMap<EntityKey, u64>) -> Result<Arc<CurrentValues>> {
        let selected = self.poll_targets()?;
        if selected.is_empty() {
            bail!(
                "no block devices to poll under {}",
                self.sysfs.root().display()
            );
        }

        let mut sources = Vec::with_capacity(selected.len());
        for dev in &selected {
            self.seed_name(dev);
            let name = self.resolver.name(EntityKey::Device(dev.id));
            let reader = InflightReader::open(self.sysfs.inflight_path(&name))
                .with_context(|| format!("opening queue depth for {name}"))?;
            debug!(device = %name, path = %reader.path().display(), "polling device");
            sources.push(PolledSource {
                key: EntityKey::Device(dev.id),
                reader,
            });
        }

        let bar_width = self.cfg.queue_bar_width as u64;
        let mut groups = Vec::with_capacity(self.cfg.groups.len());
        for (idx, group) in self.cfg.groups.iter().enumerate() {
            let mut members = Vec::with_capacity(group.members.len());
            for member in &group.members {
                let pos = selected
                    .iter()
                    .position(|d| &*self.resolver.name(EntityKey::Device(d.id)) == member)
                    .with_context(|| {
                        format!("group {} member {member} is not a polled device", group.name)
                    })?;
                members.push(pos);
            }
            let key = EntityKey::Group(
                u16::try_from(idx).with_context(|| format!("too many groups: {idx}"))?,
            );
            full_scale.insert(key, bar_width * members.len() as u64);
            groups.push(PollGroup { key, members });
        }

        let driver = PollDriver::new(
            sources,
            groups,
            Arc::clone(&self.state),
            EntityFilter::allow_all(),
        );
        let current = driver.current_values();
        let cancel = self.ingest_cancel.clone();

        let handle = match self.cfg.poll_interval {
            Some(period) => tokio::spawn(async move {
                driver.run_every(period, cancel).await;
            }),
            None => {
                let warmup = self.strategy.warmup_samples() * driver.entity_count() as u64;
                let batch = SampleBatch::new(self.cfg.flush_every, warmup);
                tokio::task::spawn_blocking(move || {
                    driver.run_unthrottled(batch, cancel);
                })
            }
        };
        self.ingest_tasks.push(handle);

        info!(
            devices = selected.len(),
            groups = self.cfg.groups.len(),
            poll_interval = ?self.cfg.poll_interval,
            "queue polling started"
        );
        Ok(current)
    }

    /// Devices for queue mode: the explicit filter, or every tracked device.
    fn poll_targets(&self) -> Result<Vec<SelectedDevice>> {
        if !self.cfg.devices.trim().is_empty() {
            return parse_device_filter(&self.cfg.devices, &self.sysfs)
                .context("parsing device filter");
        }

        self.sysfs
            .tracked_devices(&self.cfg.device_prefixes)
            .context("resolving tracked devices")
    }

    /// Caches a device name given by the user; `major:minor` specs are left
    /// for sysfs resolution.
    fn seed_name(&self, dev: &SelectedDevice) {
        if dev.name != dev.id.to_string() {
            self.resolver.insert(EntityKey::Device(dev.id), &dev.name);
        }
    }

    /// Spawn the periodic interval reset.
    fn spawn_interval_reset(&mut self) {
        let cancel = self.ingest_cancel.clone();
        let state = Arc::clone(&self.state);
        let period = self.cfg.interval;

        self.ingest_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        state.reset_intervals();
                        debug!(entities = state.entity_count(), "interval reset");
                    }
                }
            }
        }));
    }

    fn spawn_renderer(
        &mut self,
        current: Option<Arc<CurrentValues>>,
        full_scale: HashMap<EntityKey, u64>,
    ) -> Result<()> {
        let output = self
            .output
            .take()
            .context("renderer output already taken")?;

        let opts = RenderOptions {
            title: self.cfg.mode.title().to_string(),
            view: if self.cfg.mode.is_latency() {
                View::Latency
            } else {
                View::Queue
            },
            percentiles: self.cfg.percentiles().to_vec(),
            show_top: self.cfg.show_top,
            batch: self.cfg.batch,
            interval: self.cfg.interval,
            strategy: self.strategy.describe(),
            bar_width: self.cfg.queue_bar_width,
            full_scale,
        };

        let mut renderer = Renderer::new(
            output,
            opts,
            Arc::clone(&self.state),
            Arc::clone(&self.resolver),
            Arc::clone(&self.stats),
        );
        if let Some(current) = current {
            renderer = renderer.with_current_values(current);
        }

        let period = self.cfg.frame_interval();
        let cancel = self.render_cancel.clone();
        self.render_task = Some(tokio::spawn(async move {
            renderer.run(period, cancel).await;
        }));
        Ok(())
    }
}
