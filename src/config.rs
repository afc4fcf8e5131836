use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde::Deserialize;

use crate::device::{syscalls, DEFAULT_DEVICE_PREFIXES};
use crate::estimator::histogram::DEFAULT_MAX_VALUE;
use crate::estimator::reservoir::DEFAULT_CAPACITY;
use crate::estimator::sketch::DEFAULT_ALPHA;
use crate::estimator::Strategy;
use crate::ingest::DEFAULT_FLUSH_EVERY;
use crate::tracer::DEFAULT_RING_BUFFER_SIZE;

/// Percentiles shown in latency views.
pub const LATENCY_PERCENTILES: &[f64] = &[50.0, 90.0, 95.0, 99.0, 99.9];

/// Percentiles shown in the queue view.
pub const QUEUE_PERCENTILES: &[f64] = &[
    10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 95.0, 99.0, 99.5, 99.9, 99.95, 99.99,
    99.995, 99.999, 100.0,
];

/// What is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Block I/O latency per device, from kernel tracepoints.
    #[default]
    Block,
    /// Syscall latency per syscall number, from kernel tracepoints.
    Syscall,
    /// Queue depth per device, polled from sysfs.
    Queue,
}

impl Mode {
    pub fn is_latency(self) -> bool {
        matches!(self, Self::Block | Self::Syscall)
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Block => "Block I/O Latency Monitor",
            Self::Syscall => "Syscall Latency Monitor",
            Self::Queue => "Block I/O Queue Monitor",
        }
    }
}

/// Quantile estimator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Histogram,
    Reservoir,
    Sketch,
}

/// Devices whose queue depths are summed into one extra entity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// What to measure. Default: block.
    #[serde(default)]
    pub mode: Mode,

    /// Comma-separated device names or `major:minor` pairs. Empty tracks
    /// every device matching `device_prefixes`.
    #[serde(default)]
    pub devices: String,

    /// Syscall names or numbers to trace. Default: a storage-oriented set.
    #[serde(default = "default_syscalls")]
    pub syscalls: Vec<String>,

    /// Only trace syscalls made by tasks with this command name.
    #[serde(default)]
    pub process_name: Option<String>,

    /// Interval statistics reset period. Default: 10s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Render period. Default: 100ms for latency modes, 16ms for queue mode.
    #[serde(default, with = "humantime_serde")]
    pub frame_interval: Option<Duration>,

    /// Append frames instead of redrawing the screen.
    #[serde(default)]
    pub batch: bool,

    /// Estimator. Default: sketch for latency modes, reservoir for queue mode.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,

    /// Sketch relative accuracy in (0, 1). Default: 0.01.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Reservoir capacity. Default: 10000.
    #[serde(default = "default_reservoir_size")]
    pub reservoir_size: usize,

    /// Largest value the exact histogram resolves. Default: 255.
    #[serde(default = "default_histogram_max")]
    pub histogram_max: u64,

    /// Delay between polls in queue mode. Unset polls in a tight loop.
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,

    /// Samples buffered before each state flush. Default: 1000.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Percentiles to display, each in [0, 100].
    #[serde(default)]
    pub percentiles: Option<Vec<f64>>,

    /// Show the five largest values per entity.
    #[serde(default)]
    pub show_top: bool,

    /// Root of the sysfs mount. Default: /sys.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Capacity of the queue between tracer and aggregation. Default: 65536.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// BPF ring buffer size in bytes. Default: 8MB.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: u32,

    /// Device name prefixes tracked when no device filter is given.
    #[serde(default = "default_device_prefixes")]
    pub device_prefixes: Vec<String>,

    /// Queue-mode device groups.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Width of the queue utilization bar; also the depth that fills it.
    #[serde(default = "default_queue_bar_width")]
    pub queue_bar_width: usize,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone, Args)]
pub struct CliOverrides {
    /// What to measure.
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Device filter: comma-separated names or major:minor (e.g. sdc,8:48).
    #[arg(short, long)]
    pub devices: Option<String>,

    /// Interval statistics reset period (e.g. 10s, 1m).
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Batch mode: append frames, never clear the screen.
    #[arg(long)]
    pub batch: bool,

    /// Quantile estimator.
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Sketch relative accuracy, in (0, 1).
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Reservoir capacity.
    #[arg(long)]
    pub reservoir_size: Option<usize>,

    /// Largest value resolved by the exact histogram.
    #[arg(long)]
    pub histogram_max: Option<u64>,

    /// Delay between polls in queue mode; omit for a tight loop.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Samples buffered before each state flush.
    #[arg(long)]
    pub flush_every: Option<usize>,

    /// Render period.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub frame_interval: Option<Duration>,

    /// Syscalls to trace: comma-separated names or numbers.
    #[arg(short, long, value_delimiter = ',')]
    pub syscalls: Option<Vec<String>>,

    /// Only trace syscalls from tasks with this command name.
    #[arg(short = 'c', long)]
    pub process_name: Option<String>,

    /// Show the five largest values per entity.
    #[arg(long)]
    pub top: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_syscalls() -> Vec<String> {
    syscalls::DEFAULT_SYSCALLS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}

fn default_reservoir_size() -> usize {
    DEFAULT_CAPACITY
}

fn default_histogram_max() -> u64 {
    DEFAULT_MAX_VALUE
}

fn default_flush_every() -> usize {
    DEFAULT_FLUSH_EVERY
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_event_queue_capacity() -> usize {
    65_536
}

fn default_ring_buffer_size() -> u32 {
    DEFAULT_RING_BUFFER_SIZE
}

fn default_device_prefixes() -> Vec<String> {
    DEFAULT_DEVICE_PREFIXES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_queue_bar_width() -> usize {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mode: Mode::default(),
            devices: String::new(),
            syscalls: default_syscalls(),
            process_name: None,
            interval: default_interval(),
            frame_interval: None,
            batch: false,
            strategy: None,
            alpha: default_alpha(),
            reservoir_size: default_reservoir_size(),
            histogram_max: default_histogram_max(),
            poll_interval: None,
            flush_every: default_flush_every(),
            percentiles: None,
            show_top: false,
            sysfs_root: default_sysfs_root(),
            event_queue_capacity: default_event_queue_capacity(),
            ring_buffer_size: default_ring_buffer_size(),
            device_prefixes: default_device_prefixes(),
            groups: Vec::new(),
            queue_bar_width: default_queue_bar_width(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Applies command-line values on top of the file or defaults.
    pub fn apply(&mut self, cli: &CliOverrides) {
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if let Some(devices) = &cli.devices {
            self.devices.clone_from(devices);
        }
        if let Some(interval) = cli.interval {
            self.interval = interval;
        }
        self.batch |= cli.batch;
        if cli.strategy.is_some() {
            self.strategy = cli.strategy;
        }
        if let Some(alpha) = cli.alpha {
            self.alpha = alpha;
        }
        if let Some(size) = cli.reservoir_size {
            self.reservoir_size = size;
        }
        if let Some(max) = cli.histogram_max {
            self.histogram_max = max;
        }
        if cli.poll_interval.is_some() {
            self.poll_interval = cli.poll_interval;
        }
        if let Some(n) = cli.flush_every {
            self.flush_every = n;
        }
        if cli.frame_interval.is_some() {
            self.frame_interval = cli.frame_interval;
        }
        if let Some(list) = &cli.syscalls {
            self.syscalls.clone_from(list);
        }
        if cli.process_name.is_some() {
            self.process_name.clone_from(&cli.process_name);
        }
        self.show_top |= cli.top;
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        self.strategy()
            .with_context(|| format!("invalid {:?} estimator settings", self.strategy_kind()))?;

        if self.flush_every == 0 {
            bail!("flush_every must be positive");
        }

        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.frame_interval().is_zero() {
            bail!("frame_interval must be positive");
        }

        if self.poll_interval.is_some_and(|d| d.is_zero()) {
            bail!("poll_interval must be positive when set");
        }

        let percentiles = self.percentiles();
        if percentiles.is_empty() {
            bail!("percentiles must not be empty");
        }
        for &p in percentiles {
            if !(0.0..=100.0).contains(&p) {
                bail!("percentile {p} is outside [0, 100]");
            }
        }

        if self.event_queue_capacity == 0 {
            bail!("event_queue_capacity must be positive");
        }

        if self.ring_buffer_size == 0 {
            bail!("ring_buffer_size must be positive");
        }

        if self.queue_bar_width == 0 {
            bail!("queue_bar_width must be positive");
        }

        if self.mode == Mode::Syscall {
            if self.syscalls.is_empty() {
                bail!("syscalls must not be empty in syscall mode");
            }
            syscalls::parse_list(&self.syscalls)?;
        }

        for group in &self.groups {
            if group.name.is_empty() {
                bail!("group name is required");
            }
            if group.members.is_empty() {
                bail!("group {} has no members", group.name);
            }
        }

        Ok(())
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.unwrap_or(match self.mode {
            Mode::Queue => StrategyKind::Reservoir,
            Mode::Block | Mode::Syscall => StrategyKind::Sketch,
        })
    }

    /// Builds the estimator strategy, validating its parameter.
    pub fn strategy(&self) -> Result<Strategy> {
        match self.strategy_kind() {
            StrategyKind::Histogram => Strategy::histogram(self.histogram_max),
            StrategyKind::Reservoir => Strategy::reservoir(self.reservoir_size),
            StrategyKind::Sketch => Strategy::sketch(self.alpha),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval.unwrap_or(match self.mode {
            Mode::Queue => Duration::from_millis(16),
            Mode::Block | Mode::Syscall => Duration::from_millis(100),
        })
    }

    pub fn percentiles(&self) -> &[f64] {
        match (&self.percentiles, self.mode) {
            (Some(list), _) => list,
            (None, Mode::Queue) => QUEUE_PERCENTILES,
            (None, _) => LATENCY_PERCENTILES,
        }
    }
}
