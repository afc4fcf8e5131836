//! Fixed-rate frame rendering.
//!
//! Each cycle copies the aggregation state, formats a complete frame into a
//! reusable buffer and hands it to the writer in a single `write_all`, so a
//! terminal never shows half a frame. Batch mode never clears the screen and
//! separates frames with a blank line.
//!
//! Under [`Renderer::run`] the write itself happens on the blocking pool, so a
//! stalled terminal or pipe never parks a runtime worker.

pub mod format;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::Resolver;
use crate::state::{AggregationState, CurrentValues, EntitySnapshot, StateSnapshot, StatsView};
use crate::tracer::event::EntityKey;
use crate::tracer::stats::IngestStats;

use self::format::{
    format_count, format_depth, format_duration, format_latency, format_latency_opt, make_bar,
    percentile_header, push_columns, scale_to_width,
};

/// Moves the cursor home and clears the screen.
const CLEAR_SCREEN: &str = "\x1b[H\x1b[J";

const NAME_WIDTH: usize = 12;
const COLUMN_WIDTH: usize = 8;
const SAMPLES_WIDTH: usize = 9;

/// Which table layout a frame uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Latency values in microseconds: avg, percentiles, min, max.
    Latency,
    /// Queue depths: current, utilization, percentiles with avg, bar.
    Queue,
}

/// Static presentation settings.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub title: String,
    pub view: View,
    /// Percentiles in `[0, 100]`, in display order.
    pub percentiles: Vec<f64>,
    /// Show the five largest values instead of a single max column.
    pub show_top: bool,
    /// Append-only output without screen clearing.
    pub batch: bool,
    /// Interval reset period, shown in the header.
    pub interval: Duration,
    /// Estimator description, shown in the header.
    pub strategy: String,
    /// Width of the queue utilization bar.
    pub bar_width: usize,
    /// Depth that fills the bar, per entity. Defaults to `bar_width`.
    pub full_scale: HashMap<EntityKey, u64>,
}

#[derive(Clone, Copy)]
enum Window {
    Interval,
    Lifetime,
}

impl Window {
    fn label(self) -> &'static str {
        match self {
            Self::Interval => "INTERVAL",
            Self::Lifetime => "LIFETIME",
        }
    }

    fn view(self, entity: &EntitySnapshot) -> &StatsView {
        match self {
            Self::Interval => &entity.interval,
            Self::Lifetime => &entity.lifetime,
        }
    }
}

/// Writes frames built from [`AggregationState`] snapshots.
pub struct Renderer<W: Write> {
    /// `None` only if a blocking write task panicked and took the writer.
    out: Option<W>,
    opts: RenderOptions,
    state: Arc<AggregationState>,
    resolver: Arc<Resolver>,
    current: Option<Arc<CurrentValues>>,
    ingest: Arc<IngestStats>,
    buf: String,
    last: Option<(Instant, u64)>,
    frames: u64,
    write_failed: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(
        out: W,
        opts: RenderOptions,
        state: Arc<AggregationState>,
        resolver: Arc<Resolver>,
        ingest: Arc<IngestStats>,
    ) -> Self {
        Self {
            out: Some(out),
            opts,
            state,
            resolver,
            current: None,
            ingest,
            buf: String::with_capacity(8 * 1024),
            last: None,
            frames: 0,
            write_failed: false,
        }
    }

    /// Attaches the current-value cells published by a poll driver.
    pub fn with_current_values(mut self, current: Arc<CurrentValues>) -> Self {
        self.current = Some(current);
        self
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> Option<W> {
        self.out
    }

    /// Takes a snapshot and writes one frame on the calling thread.
    pub fn render(&mut self) {
        let snap = self.state.snapshot();
        self.build_frame(&snap);

        if let Some(out) = self.out.as_mut() {
            let result = write_frame(out, &self.buf);
            self.finish_write(result);
        }
    }

    fn finish_write(&mut self, result: std::io::Result<()>) {
        match result {
            Ok(()) => {
                self.frames += 1;
                self.write_failed = false;
            }
            Err(e) => {
                // Report once per run of failures.
                if !self.write_failed {
                    warn!(error = %e, "frame write failed");
                }
                self.write_failed = true;
            }
        }
    }
}

impl<W: Write + Send + 'static> Renderer<W> {
    /// Renders on every tick of `period`, then once more after `cancel`.
    /// Returns the writer once the final frame has been written.
    pub async fn run(mut self, period: Duration, cancel: CancellationToken) -> Option<W> {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.render_offloaded().await,
            }
        }

        self.render_offloaded().await;
        debug!(frames = self.frames, "renderer stopped");
        self.out
    }

    /// Builds a frame here and writes it from the blocking pool.
    async fn render_offloaded(&mut self) {
        let snap = self.state.snapshot();
        self.build_frame(&snap);

        let Some(mut out) = self.out.take() else {
            return;
        };
        let buf = std::mem::take(&mut self.buf);
        let task = tokio::task::spawn_blocking(move || {
            let result = write_frame(&mut out, &buf);
            (out, buf, result)
        });

        match task.await {
            Ok((out, buf, result)) => {
                self.out = Some(out);
                self.buf = buf;
                self.finish_write(result);
            }
            Err(e) => warn!(error = %e, "frame writer task failed; output disabled"),
        }
    }
}

impl<W: Write> Renderer<W> {

    /// Formats a full frame for `snap` into the internal buffer.
    pub fn build_frame(&mut self, snap: &StateSnapshot) -> &str {
        let mut out = std::mem::take(&mut self.buf);
        out.clear();

        if !self.opts.batch {
            out.push_str(CLEAR_SCREEN);
        }

        self.push_header(&mut out, snap);
        let width = self.line_width();
        push_rule(&mut out, '=', width);
        self.push_table(&mut out, snap, Window::Interval, width);
        out.push('\n');
        self.push_table(&mut out, snap, Window::Lifetime, width);
        push_rule(&mut out, '=', width);
        self.push_summary(&mut out, snap);

        if self.opts.batch {
            out.push('\n');
        }

        self.buf = out;
        &self.buf
    }

    fn push_header(&self, out: &mut String, snap: &StateSnapshot) {
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        let uptime = snap.taken_at.saturating_duration_since(snap.started_at);
        let in_interval = snap.taken_at.saturating_duration_since(snap.last_reset);

        if self.opts.batch {
            let _ = write!(out, "[{timestamp}] {}", self.opts.title);
        } else {
            let _ = write!(out, "{} - {timestamp}", self.opts.title);
        }
        let _ = writeln!(
            out,
            " (uptime: {}, interval: {}/{}) | {}",
            format_duration(uptime),
            format_duration(in_interval),
            format_duration(self.opts.interval),
            self.opts.strategy,
        );
    }

    fn column_headers(&self) -> Vec<String> {
        let pcts = self.opts.percentiles.iter().map(|&p| percentile_header(p));
        match self.opts.view {
            View::Latency => {
                let mut cols = vec!["avg".to_string()];
                cols.extend(pcts);
                cols.push("min".to_string());
                if self.opts.show_top {
                    cols.extend(["max-4", "max-3", "max-2", "max-1"].map(String::from));
                }
                cols.push("max".to_string());
                cols
            }
            View::Queue => {
                let mut cols = vec!["Current".to_string(), "Util".to_string()];
                for (i, header) in pcts.enumerate() {
                    cols.push(header);
                    if Some(i) == self.avg_position() {
                        cols.push("Avg".to_string());
                    }
                }
                if self.avg_position().is_none() {
                    cols.push("Avg".to_string());
                }
                cols
            }
        }
    }

    /// Index of the P50 column; the queue view puts Avg right after it.
    fn avg_position(&self) -> Option<usize> {
        self.opts.percentiles.iter().position(|&p| p == 50.0)
    }

    fn line_width(&self) -> usize {
        let cols = self.column_headers().len();
        let mut width = NAME_WIDTH + 2 + cols * (COLUMN_WIDTH + 1) + 3 + SAMPLES_WIDTH;
        if self.opts.view == View::Queue {
            width += self.opts.bar_width + 4;
        }
        width
    }

    fn push_table(&self, out: &mut String, snap: &StateSnapshot, window: Window, width: usize) {
        let _ = write!(out, "{:<w$} │", window.label(), w = NAME_WIDTH);
        push_columns(out, &self.column_headers(), COLUMN_WIDTH);
        let _ = write!(out, " │ {:>w$}", "samples", w = SAMPLES_WIDTH);
        if self.opts.view == View::Queue {
            let _ = write!(out, "  {:<w$}", "Utilization", w = self.opts.bar_width + 2);
        }
        out.push('\n');
        push_rule(out, '-', width);

        for (key, entity) in &snap.entities {
            let name = self.resolver.name(*key);
            let view = window.view(entity);
            let _ = write!(out, "{:<w$} │", truncate(&name, NAME_WIDTH), w = NAME_WIDTH);

            let cells = match self.opts.view {
                View::Latency => self.latency_cells(view),
                View::Queue => self.queue_cells(*key, view),
            };
            push_columns(out, &cells, COLUMN_WIDTH);
            let _ = write!(
                out,
                " │ {:>w$}",
                format_count(view.exact.count),
                w = SAMPLES_WIDTH
            );

            if self.opts.view == View::Queue {
                let _ = write!(out, "  [{}]", self.queue_bar(*key, entity));
            }
            out.push('\n');
        }
    }

    fn latency_cells(&self, view: &StatsView) -> Vec<String> {
        let n = self.column_headers().len();
        if view.exact.count == 0 {
            return vec!["-".to_string(); n];
        }

        let mut cells = Vec::with_capacity(n);
        cells.push(format_latency_opt(view.exact.mean()));
        for &p in &self.opts.percentiles {
            cells.push(format_latency_opt(view.quantile(p / 100.0)));
        }
        cells.push(format_latency(view.exact.min()));
        if self.opts.show_top {
            let top = view.top.values();
            // Largest value sits in the max column; pad missing ranks.
            let below_max = &top[..top.len().saturating_sub(1)];
            for _ in below_max.len()..4 {
                cells.push("-".to_string());
            }
            cells.extend(below_max.iter().map(|&v| format_latency(v)));
        }
        cells.push(format_latency(view.exact.max));
        cells
    }

    fn queue_cells(&self, key: EntityKey, view: &StatsView) -> Vec<String> {
        let current = self
            .current
            .as_ref()
            .and_then(|c| c.get(key))
            .map_or_else(|| "-".to_string(), |v| v.to_string());
        let util = view
            .exact
            .utilization()
            .map_or_else(|| "-".to_string(), |u| format!("{:.1}%", u * 100.0));
        let avg = format_depth(view.exact.mean());

        let mut cells = vec![current, util];
        for (i, &p) in self.opts.percentiles.iter().enumerate() {
            cells.push(format_depth(view.quantile(p / 100.0)));
            if Some(i) == self.avg_position() {
                cells.push(avg.clone());
            }
        }
        if self.avg_position().is_none() {
            cells.push(avg);
        }
        cells
    }

    /// Current depth against the long-term p99.
    fn queue_bar(&self, key: EntityKey, entity: &EntitySnapshot) -> String {
        let width = self.opts.bar_width;
        let full = self
            .opts
            .full_scale
            .get(&key)
            .copied()
            .unwrap_or(width as u64) as f64;
        let current = self
            .current
            .as_ref()
            .and_then(|c| c.get(key))
            .unwrap_or(0) as f64;
        let p99 = entity.lifetime.quantile(0.99).unwrap_or(0.0);
        make_bar(
            scale_to_width(current, full, width),
            scale_to_width(p99, full, width),
            width,
        )
    }

    fn push_summary(&mut self, out: &mut String, snap: &StateSnapshot) {
        let total = snap.total_count();
        let uptime = snap
            .taken_at
            .saturating_duration_since(snap.started_at)
            .as_secs_f64();
        let rate = if uptime > 0.0 {
            total as f64 / uptime
        } else {
            0.0
        };
        let now_rate = match self.last {
            Some((at, count)) => {
                let secs = snap.taken_at.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    total.saturating_sub(count) as f64 / secs
                } else {
                    0.0
                }
            }
            None => rate,
        };
        self.last = Some((snap.taken_at, total));

        let _ = write!(
            out,
            "Total: {} samples | Rate: {}/s | Now: {}/s",
            format_count(total),
            format_count(rate as u64),
            format_count(now_rate as u64),
        );

        let totals = self.ingest.totals();
        let recent = self.ingest.take_dropped();
        if totals.dropped > 0 {
            let _ = write!(
                out,
                " | Dropped: {} (+{})",
                format_count(totals.dropped),
                format_count(recent)
            );
        }

        let memory: usize = snap
            .entities
            .iter()
            .map(|(_, e)| e.interval.estimator.memory_bytes() + e.lifetime.estimator.memory_bytes())
            .sum();
        let _ = writeln!(out, " | Estimators: ~{}KB", memory.div_ceil(1024));

        if self.opts.view == View::Queue {
            out.push_str("Legend: █ = current  ░ = p99 (long-term)  - = unused\n");
        }
    }
}

fn write_frame<W: Write>(out: &mut W, frame: &str) -> std::io::Result<()> {
    out.write_all(frame.as_bytes())?;
    out.flush()
}

fn push_rule(out: &mut String, ch: char, width: usize) {
    out.extend(std::iter::repeat(ch).take(width));
    out.push('\n');
}

fn truncate(name: &str, width: usize) -> &str {
    match name.char_indices().nth(width) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}
