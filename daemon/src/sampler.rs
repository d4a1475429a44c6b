//! Periodic sampling task: OS readings in, one snapshot per tick out

use crate::collector::{RawProcess, RawSample, SystemCollector};
use crate::config::SamplingConfig;
use crate::error::CollectError;
use crate::snapshot::{ProcessSample, Snapshot, Timestamp};
use crate::window::WindowWriter;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct Sampler<C> {
    collector: Arc<C>,
    writer: WindowWriter,
    interval: Duration,
    tick_timeout: Duration,
    max_processes: usize,
    /// A collection that outlived its tick. At most one is ever running.
    in_flight: Mutex<Option<JoinHandle<Result<RawSample, CollectError>>>>,
}

impl<C: SystemCollector + 'static> Sampler<C> {
    pub fn new(collector: C, writer: WindowWriter, config: &SamplingConfig) -> Self {
        Self {
            collector: Arc::new(collector),
            writer,
            interval: config.sample_interval(),
            tick_timeout: Duration::from_millis(config.tick_timeout_ms),
            max_processes: config.max_processes,
            in_flight: Mutex::new(None),
        }
    }

    /// Runs one tick. Returns the appended snapshot, or `None` when the
    /// tick was skipped.
    ///
    /// A collection that times out keeps running on the blocking pool; later
    /// ticks are skipped until it returns, and its late result is dropped.
    pub async fn tick(&self) -> Option<Arc<Snapshot>> {
        let mut task = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(pending) = in_flight.take() {
                if !pending.is_finished() {
                    *in_flight = Some(pending);
                    warn!("Previous collection still running, skipping tick");
                    return None;
                }
            }
            let collector = Arc::clone(&self.collector);
            tokio::task::spawn_blocking(move || collector.collect())
        };
        let raw = match tokio::time::timeout(self.tick_timeout, &mut task).await {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(e))) => {
                warn!("Sampling tick skipped: {}", e);
                return None;
            }
            Ok(Err(e)) => {
                error!("Collector task failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Sampling tick timed out after {:?}", self.tick_timeout);
                *self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
                return None;
            }
        };
        let window = self.writer.reader().all();
        let snapshot = build_snapshot(raw, &window, self.max_processes);
        debug!(
            "Sampled cpu={:.1}% procs={}",
            snapshot.cpu_total_percent,
            snapshot.processes.len()
        );
        Some(self.writer.append(snapshot))
    }

    /// Samples on a fixed period until `shutdown` flips to `true` or its
    /// sender is dropped. A failed tick never ends the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Sampler started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sampler stopped");
    }
}

/// Turns a raw reading into a snapshot, using `window` (the retained
/// snapshots before this tick) for the per-process RSS delta.
pub fn build_snapshot(raw: RawSample, window: &[Arc<Snapshot>], max_processes: usize) -> Snapshot {
    let timestamp = raw.timestamp;
    let processes = rank_processes(&raw.processes, max_processes)
        .into_iter()
        .map(|p| {
            let rss_delta_per_minute =
                rss_delta_per_minute(window, p.pid, p.resident_bytes, timestamp);
            ProcessSample {
                pid: p.pid,
                name: p.name,
                cpu_percent: p.cpu_percent,
                resident_bytes: p.resident_bytes,
                rss_delta_per_minute,
            }
        })
        .collect();

    Snapshot {
        timestamp,
        cpu_total_percent: raw.cpu_total_percent,
        mem_total_bytes: raw.mem_total_bytes,
        mem_avail_bytes: raw.mem_avail_bytes,
        swap_used_bytes: raw.swap_used_bytes,
        disk_read_bytes_per_sec: raw.disk_read_bytes_per_sec,
        disk_write_bytes_per_sec: raw.disk_write_bytes_per_sec,
        net_recv_bytes_per_sec: raw.net_recv_bytes_per_sec,
        net_sent_bytes_per_sec: raw.net_sent_bytes_per_sec,
        processes,
    }
}

/// Union of the top `k` by CPU and the top `k` by RSS, one entry per pid.
/// CPU-ranked entries come first, then memory-only entries in RSS order.
pub fn rank_processes(processes: &[RawProcess], k: usize) -> Vec<RawProcess> {
    let mut by_cpu: Vec<&RawProcess> = processes.iter().collect();
    by_cpu.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then(a.pid.cmp(&b.pid))
    });
    let mut by_mem: Vec<&RawProcess> = processes.iter().collect();
    by_mem.sort_by(|a, b| {
        b.resident_bytes
            .cmp(&a.resident_bytes)
            .then(a.pid.cmp(&b.pid))
    });

    let mut seen = HashSet::new();
    by_cpu
        .into_iter()
        .take(k)
        .chain(by_mem.into_iter().take(k))
        .filter(|p| seen.insert(p.pid))
        .cloned()
        .collect()
}

/// Bytes per minute between the earliest retained sample of `pid` and
/// `rss_now`. Zero when the pid has no earlier sample.
pub fn rss_delta_per_minute(
    window: &[Arc<Snapshot>],
    pid: u32,
    rss_now: u64,
    now: Timestamp,
) -> i64 {
    let Some((then, rss_then)) = window
        .iter()
        .find_map(|s| s.process(pid).map(|p| (s.timestamp, p.resident_bytes)))
    else {
        return 0;
    };
    let minutes = (now - then) / 60.0;
    if minutes <= 0.0 {
        return 0;
    }
    let delta = rss_now as f64 - rss_then as f64;
    (delta / minutes).round() as i64
}
