//! Human-readable value formatting for rendered frames.

use std::fmt::Write as _;
use std::time::Duration;

/// Formats a latency in microseconds: `950µs`, `12ms`, `1.5s`.
/// Milliseconds are rounded to the nearest whole value.
pub fn format_latency(us: u64) -> String {
    if us < 1_000 {
        return format!("{us}µs");
    }
    if us < 1_000_000 {
        return format!("{}ms", (us + 500) / 1_000);
    }
    format!("{:.1}s", us as f64 / 1_000_000.0)
}

/// Formats an optional quantile as latency, `-` when absent.
pub fn format_latency_opt(us: Option<f64>) -> String {
    match us {
        Some(v) => format_latency(v.round().max(0.0) as u64),
        None => "-".to_string(),
    }
}

/// Formats a count with K/M/B suffixes above one thousand.
pub fn format_count(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.1}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Formats an elapsed duration: `4.2s`, `3m7s`, `2h15m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        return format!("{:.1}s", d.as_secs_f64());
    }
    if secs < 3_600 {
        return format!("{}m{}s", secs / 60, secs % 60);
    }
    format!("{}h{}m", secs / 3_600, (secs / 60) % 60)
}

/// Formats an optional queue-depth quantile with two decimals.
pub fn format_depth(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.2}"),
        None => "-".to_string(),
    }
}

/// Column header for a percentile: `P50`, `P99.9`.
pub fn percentile_header(pct: f64) -> String {
    if pct.fract() == 0.0 {
        format!("P{}", pct as u64)
    } else {
        format!("P{pct}")
    }
}

/// Utilization bar of `width` cells: `█` up to `current`, `░` up to
/// `long_term`, `-` for the rest.
pub fn make_bar(current: usize, long_term: usize, width: usize) -> String {
    let mut bar = String::with_capacity(width * 3);
    for i in 1..=width {
        let cell = if i <= current {
            '█'
        } else if i <= long_term {
            '░'
        } else {
            '-'
        };
        bar.push(cell);
    }
    bar
}

/// Scales `value` out of `full` onto `width` cells, rounding to nearest.
pub fn scale_to_width(value: f64, full: f64, width: usize) -> usize {
    if full <= 0.0 || !value.is_finite() {
        return 0;
    }
    ((value / full * width as f64) + 0.5).clamp(0.0, width as f64) as usize
}

/// Appends `cells` right-aligned in `width`-wide columns separated by a space.
pub(crate) fn push_columns(out: &mut String, cells: &[String], width: usize) {
    for cell in cells {
        let _ = write!(out, " {cell:>width$}");
    }
}
