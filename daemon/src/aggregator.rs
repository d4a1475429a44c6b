//! Window statistics: point-in-time summary and trend analysis

use crate::snapshot::{ProcessSample, Snapshot, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const TOP_PROCESSES: usize = 5;

/// Result of a computation that needs a minimum amount of history.
/// `InsufficientData` means "still collecting", not failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness<T> {
    Ready(T),
    InsufficientData { available: usize, required: usize },
}

impl<T> Readiness<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Readiness::Ready(value) => Some(value),
            Readiness::InsufficientData { .. } => None,
        }
    }

    pub fn as_ref(&self) -> Readiness<&T> {
        match self {
            Readiness::Ready(value) => Readiness::Ready(value),
            Readiness::InsufficientData {
                available,
                required,
            } => Readiness::InsufficientData {
                available: *available,
                required: *required,
            },
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Readiness<U> {
        match self {
            Readiness::Ready(value) => Readiness::Ready(f(value)),
            Readiness::InsufficientData {
                available,
                required,
            } => Readiness::InsufficientData {
                available,
                required,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub sample_count: usize,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub cpu_total_median: f64,
    pub mem_avail_median: u64,
    pub mem_total_bytes: u64,
    pub swap_used_now: u64,
    pub disk_read_bytes_per_sec_now: u64,
    pub disk_write_bytes_per_sec_now: u64,
    pub top_processes: Vec<ProcessSample>,
}

pub fn summarize(window: &[Arc<Snapshot>], min_samples: usize) -> Readiness<Summary> {
    let required = min_samples.max(1);
    let (Some(first), Some(latest)) = (window.first(), window.last()) else {
        return Readiness::InsufficientData {
            available: 0,
            required,
        };
    };
    if window.len() < required {
        return Readiness::InsufficientData {
            available: window.len(),
            required,
        };
    }

    let cpu: Vec<f64> = window.iter().map(|s| s.cpu_total_percent).collect();
    let avail: Vec<f64> = window.iter().map(|s| s.mem_avail_bytes as f64).collect();

    Readiness::Ready(Summary {
        sample_count: window.len(),
        window_start: first.timestamp,
        window_end: latest.timestamp,
        cpu_total_median: median(&cpu).unwrap_or(0.0),
        mem_avail_median: median(&avail).unwrap_or(0.0).round() as u64,
        mem_total_bytes: latest.mem_total_bytes,
        swap_used_now: latest.swap_used_bytes,
        disk_read_bytes_per_sec_now: latest.disk_read_bytes_per_sec,
        disk_write_bytes_per_sec_now: latest.disk_write_bytes_per_sec,
        top_processes: top_by_combined_rank(&latest.processes, TOP_PROCESSES),
    })
}

/// Middle value; mean of the two middle values for an even count.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Orders by CPU rank plus RSS rank (both 1-based), lowest first. Ties go
/// to higher CPU, then lower pid.
pub fn top_by_combined_rank(processes: &[ProcessSample], n: usize) -> Vec<ProcessSample> {
    let mut by_cpu: Vec<&ProcessSample> = processes.iter().collect();
    by_cpu.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then(a.pid.cmp(&b.pid))
    });
    let mut by_mem: Vec<&ProcessSample> = processes.iter().collect();
    by_mem.sort_by(|a, b| {
        b.resident_bytes
            .cmp(&a.resident_bytes)
            .then(a.pid.cmp(&b.pid))
    });

    let mut rank: HashMap<u32, usize> = HashMap::new();
    for (i, p) in by_cpu.iter().enumerate() {
        *rank.entry(p.pid).or_default() += i + 1;
    }
    for (i, p) in by_mem.iter().enumerate() {
        *rank.entry(p.pid).or_default() += i + 1;
    }

    let mut ranked = by_cpu;
    ranked.sort_by(|a, b| {
        rank[&a.pid]
            .cmp(&rank[&b.pid])
            .then(b.cpu_percent.total_cmp(&a.cpu_percent))
            .then(a.pid.cmp(&b.pid))
    });
    ranked.into_iter().take(n).cloned().collect()
}

/// Mean CPU over snapshots no older than `span_secs` before the newest.
pub fn cpu_moving_average(window: &[Arc<Snapshot>], span_secs: f64) -> Option<f64> {
    let latest = window.last()?;
    let cutoff = latest.timestamp - span_secs;
    let values: Vec<f64> = window
        .iter()
        .filter(|s| s.timestamp >= cutoff)
        .map(|s| s.cpu_total_percent)
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    Cpu,
    Memory,
}

impl TrendMetric {
    fn value(self, snapshot: &Snapshot) -> f64 {
        match self {
            TrendMetric::Cpu => snapshot.cpu_total_percent,
            TrendMetric::Memory => snapshot.mem_used_percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendStats {
    pub metric: TrendMetric,
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub first: f64,
    pub current: f64,
    pub change: f64,
    pub trend: TrendDirection,
}

/// Statistics for `metric` over snapshots taken at or after `cutoff`.
pub fn trend(
    window: &[Arc<Snapshot>],
    cutoff: Timestamp,
    metric: TrendMetric,
    min_samples: usize,
) -> Readiness<TrendStats> {
    let required = min_samples.max(2);
    let values: Vec<f64> = window
        .iter()
        .filter(|s| s.timestamp >= cutoff)
        .map(|s| metric.value(s))
        .collect();
    let (Some(&first), Some(&current)) = (values.first(), values.last()) else {
        return Readiness::InsufficientData {
            available: 0,
            required,
        };
    };
    if values.len() < required {
        return Readiness::InsufficientData {
            available: values.len(),
            required,
        };
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    let change = current - first;
    Readiness::Ready(TrendStats {
        metric,
        samples: values.len(),
        min,
        max,
        avg,
        first,
        current,
        change,
        trend: if change > 0.0 {
            TrendDirection::Increasing
        } else {
            TrendDirection::Decreasing
        },
    })
}
