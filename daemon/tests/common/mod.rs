//! Builders shared by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysdoctor_daemon::collector::{
    DiskUsage, RawProcess, RawSample, SpaceUsage, SystemCollector, UsageTarget,
};
use sysdoctor_daemon::error::CollectError;
use sysdoctor_daemon::snapshot::{ProcessSample, Snapshot, MIB};

pub const GIB: u64 = 1024 * MIB;

pub fn process(pid: u32, name: &str, cpu_percent: f64, resident_bytes: u64) -> ProcessSample {
    ProcessSample {
        pid,
        name: name.to_string(),
        cpu_percent,
        resident_bytes,
        rss_delta_per_minute: 0,
    }
}

/// A quiet 16 GiB machine at `timestamp` with the given total CPU.
pub fn snapshot(timestamp: f64, cpu_total_percent: f64) -> Snapshot {
    Snapshot {
        timestamp,
        cpu_total_percent,
        mem_total_bytes: 16 * GIB,
        mem_avail_bytes: 8 * GIB,
        swap_used_bytes: 0,
        disk_read_bytes_per_sec: MIB,
        disk_write_bytes_per_sec: MIB,
        net_recv_bytes_per_sec: 0,
        net_sent_bytes_per_sec: 0,
        processes: Vec::new(),
    }
}

pub fn arcs(snapshots: Vec<Snapshot>) -> Vec<Arc<Snapshot>> {
    snapshots.into_iter().map(Arc::new).collect()
}

pub fn raw_process(pid: u32, name: &str, cpu_percent: f64, resident_bytes: u64) -> RawProcess {
    RawProcess {
        pid,
        name: name.to_string(),
        cpu_percent,
        resident_bytes,
    }
}

pub fn raw_sample(timestamp: f64, processes: Vec<RawProcess>) -> RawSample {
    RawSample {
        timestamp,
        cpu_total_percent: 20.0,
        mem_total_bytes: 16 * GIB,
        mem_avail_bytes: 8 * GIB,
        swap_used_bytes: 0,
        disk_read_bytes_per_sec: 0,
        disk_write_bytes_per_sec: 0,
        net_recv_bytes_per_sec: 0,
        net_sent_bytes_per_sec: 0,
        processes,
    }
}

/// Replays a fixed script of readings, one per call, ticking the clock by
/// one second. Past the end of the script it repeats the last entry.
pub struct ScriptedCollector {
    script: Mutex<Vec<Result<RawSample, String>>>,
    calls: AtomicU64,
    delay: Duration,
}

impl ScriptedCollector {
    pub fn new(script: Vec<Result<RawSample, String>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicU64::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn steady(cpu_total_percent: f64) -> Self {
        let mut sample = raw_sample(0.0, vec![raw_process(1, "init", 0.1, 10 * MIB)]);
        sample.cpu_total_percent = cpu_total_percent;
        Self::new(vec![Ok(sample)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl SystemCollector for ScriptedCollector {
    fn collect(&self) -> Result<RawSample, CollectError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        let index = (call as usize).min(script.len() - 1);
        match &script[index] {
            Ok(sample) => {
                let mut sample = sample.clone();
                if sample.timestamp == 0.0 {
                    sample.timestamp = 1_000.0 + call as f64;
                }
                Ok(sample)
            }
            Err(detail) => Err(CollectError::Parse {
                path: "/proc/meminfo".to_string(),
                detail: detail.clone(),
            }),
        }
    }

    /// Four fixed mounts; any path except `/missing` is half full.
    fn disk_usage(&self, paths: Option<&[String]>) -> Result<Vec<DiskUsage>, CollectError> {
        let Some(paths) = paths else {
            return Ok([("/", 40.0), ("/home", 90.0), ("/boot", 10.0), ("/data", 70.0)]
                .iter()
                .map(|&(mount, used)| DiskUsage {
                    location: mount.to_string(),
                    target: UsageTarget::Mount,
                    device: Some("/dev/sda1".to_string()),
                    fstype: Some("ext4".to_string()),
                    space: Some(space(used)),
                    error: None,
                })
                .collect());
        };
        Ok(paths
            .iter()
            .map(|path| {
                let missing = path == "/missing";
                DiskUsage {
                    location: path.clone(),
                    target: UsageTarget::Path,
                    device: None,
                    fstype: None,
                    space: (!missing).then(|| space(50.0)),
                    error: missing.then(|| "inaccessible".to_string()),
                }
            })
            .collect())
    }
}

fn space(percent_used: f64) -> SpaceUsage {
    SpaceUsage {
        total_bytes: 100 * GIB,
        free_bytes: ((100.0 - percent_used) * GIB as f64) as u64,
        percent_used,
    }
}
