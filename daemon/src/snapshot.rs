//! Immutable per-tick records of system and process state

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch.
pub type Timestamp = f64;

pub const MIB: u64 = 1024 * 1024;

pub fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    /// Kernel comm name, truncated to 15 bytes on Linux.
    pub name: String,
    /// Share of one core; exceeds 100 for multi-threaded work.
    pub cpu_percent: f64,
    pub resident_bytes: u64,
    /// Zero when the pid has no earlier retained sample.
    pub rss_delta_per_minute: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: Timestamp,
    pub cpu_total_percent: f64,
    pub mem_total_bytes: u64,
    pub mem_avail_bytes: u64,
    pub swap_used_bytes: u64,
    pub disk_read_bytes_per_sec: u64,
    pub disk_write_bytes_per_sec: u64,
    pub net_recv_bytes_per_sec: u64,
    pub net_sent_bytes_per_sec: u64,
    /// Union of the top-K by CPU and top-K by RSS, one entry per pid.
    pub processes: Vec<ProcessSample>,
}

impl Snapshot {
    pub fn process(&self, pid: u32) -> Option<&ProcessSample> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Percent of physical memory not available to new allocations.
    pub fn mem_used_percent(&self) -> f64 {
        if self.mem_total_bytes == 0 {
            return 0.0;
        }
        let used = self.mem_total_bytes.saturating_sub(self.mem_avail_bytes);
        used as f64 / self.mem_total_bytes as f64 * 100.0
    }

    pub fn disk_total_bytes_per_sec(&self) -> u64 {
        self.disk_read_bytes_per_sec
            .saturating_add(self.disk_write_bytes_per_sec)
    }

    pub fn top_by_cpu(&self, n: usize) -> Vec<ProcessSample> {
        let mut procs = self.processes.clone();
        procs.sort_by(|a, b| {
            b.cpu_percent
                .total_cmp(&a.cpu_percent)
                .then(a.pid.cmp(&b.pid))
        });
        procs.truncate(n);
        procs
    }

    pub fn top_by_memory(&self, n: usize) -> Vec<ProcessSample> {
        let mut procs = self.processes.clone();
        procs.sort_by(|a, b| {
            b.resident_bytes
                .cmp(&a.resident_bytes)
                .then(a.pid.cmp(&b.pid))
        });
        procs.truncate(n);
        procs
    }

    pub fn summary(&self, include_processes: bool) -> SnapshotSummary {
        SnapshotSummary {
            timestamp: self.timestamp,
            cpu_percent: self.cpu_total_percent,
            memory_percent: self.mem_used_percent(),
            mem_avail_bytes: self.mem_avail_bytes,
            swap_used_bytes: self.swap_used_bytes,
            disk_read_bytes_per_sec: self.disk_read_bytes_per_sec,
            disk_write_bytes_per_sec: self.disk_write_bytes_per_sec,
            net_recv_bytes_per_sec: self.net_recv_bytes_per_sec,
            net_sent_bytes_per_sec: self.net_sent_bytes_per_sec,
            top_cpu_process: self.top_by_cpu(1).pop().map(|p| p.name),
            top_memory_process: self.top_by_memory(1).pop().map(|p| p.name),
            processes: include_processes.then(|| self.processes.clone()),
        }
    }
}

/// Reduced view of a [`Snapshot`] handed to history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub timestamp: Timestamp,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub mem_avail_bytes: u64,
    pub swap_used_bytes: u64,
    pub disk_read_bytes_per_sec: u64,
    pub disk_write_bytes_per_sec: u64,
    pub net_recv_bytes_per_sec: u64,
    pub net_sent_bytes_per_sec: u64,
    pub top_cpu_process: Option<String>,
    pub top_memory_process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<ProcessSample>>,
}
