//! Dashboard KPIs derived from cached statuses and history windows

use crate::cache::StatusReading;
use crate::model::CheckResult;
use serde::Serialize;

/// Aggregate health over a snapshot of service readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DashboardMetrics {
    pub up_count: usize,
    pub down_count: usize,
    /// Rounded mean latency; None when no settled status has one
    pub avg_latency_ms: Option<u64>,
    /// None while nothing is known, never a misleading 0%
    pub uptime_percent: Option<u8>,
}

impl DashboardMetrics {
    pub fn known(&self) -> usize {
        self.up_count + self.down_count
    }
}

/// Aggregate a snapshot. Loading and errored readings, and services with
/// no result yet, count toward nothing.
pub fn aggregate<'a, I>(readings: I) -> DashboardMetrics
where
    I: IntoIterator<Item = &'a StatusReading>,
{
    let settled: Vec<&CheckResult> = readings
        .into_iter()
        .filter_map(StatusReading::settled)
        .collect();

    let up_count = settled.iter().filter(|r| r.is_up).count();
    let down_count = settled.len() - up_count;

    DashboardMetrics {
        up_count,
        down_count,
        avg_latency_ms: mean_latency(settled.iter().copied()).map(round_ms),
        uptime_percent: uptime_percent(up_count, down_count),
    }
}

/// `round(100 * up / (up + down))`, None when both are zero
pub fn uptime_percent(up: usize, down: usize) -> Option<u8> {
    let total = up + down;
    if total == 0 {
        return None;
    }
    Some((100.0 * up as f64 / total as f64).round() as u8)
}

fn mean_latency<'a>(results: impl Iterator<Item = &'a CheckResult>) -> Option<f64> {
    let (sum, count) = results
        .filter_map(|r| r.response_time_ms)
        .fold((0.0, 0usize), |(sum, count), ms| (sum + ms, count + 1));

    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

fn round_ms(ms: f64) -> u64 {
    ms.max(0.0).round() as u64
}

/// Per-service figures over one history window
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HistorySummary {
    pub samples: usize,
    pub up: usize,
    pub down: usize,
    pub uptime_percent: Option<u8>,
    pub avg_latency_ms: Option<u64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
}

/// Summarize a window (any order)
pub fn summarize(window: &[CheckResult]) -> HistorySummary {
    let up = window.iter().filter(|r| r.is_up).count();
    let down = window.len() - up;
    let latencies: Vec<f64> = window.iter().filter_map(|r| r.response_time_ms).collect();

    HistorySummary {
        samples: window.len(),
        up,
        down,
        uptime_percent: uptime_percent(up, down),
        avg_latency_ms: mean_latency(window.iter()).map(round_ms),
        min_latency_ms: latencies.iter().copied().reduce(f64::min),
        max_latency_ms: latencies.iter().copied().reduce(f64::max),
    }
}

/// Chart points for an oldest-first window; results without latency are skipped
pub fn latency_series(window: &[CheckResult]) -> Vec<(chrono::DateTime<chrono::Utc>, f64)> {
    window
        .iter()
        .filter_map(|r| r.response_time_ms.map(|ms| (r.timestamp, ms)))
        .collect()
}

/// Table order: most recent first
pub fn newest_first(window: &[CheckResult]) -> Vec<CheckResult> {
    window.iter().rev().cloned().collect()
}
