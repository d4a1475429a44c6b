use super::{DiskUsage, RawProcess, RawSample, SpaceUsage, SystemCollector, UsageTarget};
use crate::error::CollectError;
use crate::snapshot::unix_now;
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

const SECTOR_BYTES: u64 = 512;

/// Virtual filesystems that never hold user data.
const PSEUDO_FILESYSTEMS: &[&str] = &[
    "autofs", "binfmt_misc", "bpf", "cgroup", "cgroup2", "configfs", "debugfs",
    "devpts", "devtmpfs", "efivarfs", "fusectl", "hugetlbfs", "mqueue", "nsfs",
    "proc", "pstore", "ramfs", "rpc_pipefs", "securityfs", "selinuxfs", "squashfs",
    "sysfs", "tmpfs", "tracefs",
];

#[derive(Clone, Copy)]
struct CpuSample {
    total_ticks: u64, // utime + stime
    timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Clone, Copy)]
struct ByteCounter {
    first: u64,
    second: u64,
    timestamp: Instant,
}

#[derive(Debug, Default, PartialEq)]
struct MemInfo {
    total_bytes: u64,
    avail_bytes: u64,
    swap_used_bytes: u64,
}

#[derive(Default)]
struct Previous {
    cpu: Option<CpuTimes>,
    disk: Option<ByteCounter>,
    net: Option<ByteCounter>,
    procs: HashMap<u32, CpuSample>,
}

pub struct LinuxCollector {
    page_size: u64,
    clock_ticks: u64,
    previous: Mutex<Previous>,
}

impl LinuxCollector {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            clock_ticks: if clock_ticks > 0 { clock_ticks as u64 } else { 100 },
            previous: Mutex::new(Previous::default()),
        }
    }

    fn previous(&self) -> MutexGuard<'_, Previous> {
        self.previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_cpu_total(&self, prev: &mut Previous) -> Result<f64, CollectError> {
        let content = read_proc("/proc/stat")?;
        let now = parse_cpu_line(&content).ok_or_else(|| CollectError::Parse {
            path: "/proc/stat".to_string(),
            detail: "aggregate cpu line not found".to_string(),
        })?;
        let percent = match prev.cpu {
            Some(before) => {
                let total = now.total.saturating_sub(before.total);
                let busy = now.busy.saturating_sub(before.busy);
                if total == 0 {
                    0.0
                } else {
                    busy as f64 / total as f64 * 100.0
                }
            }
            None => 0.0,
        };
        prev.cpu = Some(now);
        Ok(percent)
    }

    fn read_disk_rates(&self, prev: &mut Previous) -> Result<(u64, u64), CollectError> {
        let content = read_proc("/proc/diskstats")?;
        let (read, written) =
            parse_diskstats(&content, |name| Path::new("/sys/block").join(name).exists());
        Ok(rate_pair(&mut prev.disk, read, written))
    }

    fn read_net_rates(&self, prev: &mut Previous) -> Result<(u64, u64), CollectError> {
        let content = read_proc("/proc/net/dev")?;
        let (recv, sent) = parse_net_dev(&content);
        Ok(rate_pair(&mut prev.net, recv, sent))
    }

    fn parse_process(&self, pid: u32, prev: &mut Previous, now: Instant) -> Option<RawProcess> {
        let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let stat = parse_pid_stat(&content)?;

        // CPU percentage from the previous sample of this pid
        let cpu_percent = match prev.procs.get(&pid) {
            Some(before) => {
                let tick_delta = stat.total_ticks.saturating_sub(before.total_ticks);
                let elapsed = now.duration_since(before.timestamp).as_secs_f64();
                if elapsed > 0.0 {
                    let cpu_seconds = tick_delta as f64 / self.clock_ticks as f64;
                    cpu_seconds / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        prev.procs.insert(
            pid,
            CpuSample {
                total_ticks: stat.total_ticks,
                timestamp: now,
            },
        );

        Some(RawProcess {
            pid,
            name: stat.name,
            cpu_percent,
            resident_bytes: stat.rss_pages.saturating_mul(self.page_size),
        })
    }

    fn list_processes(&self, prev: &mut Previous) -> Vec<RawProcess> {
        let now = Instant::now();
        let mut processes = Vec::new();
        match fs::read_dir("/proc") {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let Some(pid) = entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.parse::<u32>().ok())
                    else {
                        continue;
                    };
                    // Exited between readdir and read, or access denied
                    if let Some(info) = self.parse_process(pid, prev, now) {
                        processes.push(info);
                    }
                }
            }
            Err(e) => debug!("Failed to list /proc: {}", e),
        }
        prune_history(&mut prev.procs, &processes);
        processes
    }
}

/// Drops CPU history for pids that are gone.
fn prune_history(history: &mut HashMap<u32, CpuSample>, live: &[RawProcess]) {
    let live: HashSet<u32> = live.iter().map(|p| p.pid).collect();
    history.retain(|pid, _| live.contains(pid));
}

impl Default for LinuxCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector for LinuxCollector {
    fn collect(&self) -> Result<RawSample, CollectError> {
        let mem = parse_meminfo(&read_proc("/proc/meminfo")?)?;
        let mut prev = self.previous();

        let cpu_total_percent = self.read_cpu_total(&mut prev).unwrap_or_else(|e| {
            debug!("CPU total unavailable: {}", e);
            0.0
        });
        let (disk_read, disk_write) = self.read_disk_rates(&mut prev).unwrap_or_else(|e| {
            debug!("Disk counters unavailable: {}", e);
            (0, 0)
        });
        let (net_recv, net_sent) = self.read_net_rates(&mut prev).unwrap_or_else(|e| {
            debug!("Network counters unavailable: {}", e);
            (0, 0)
        });
        let processes = self.list_processes(&mut prev);

        Ok(RawSample {
            timestamp: unix_now(),
            cpu_total_percent,
            mem_total_bytes: mem.total_bytes,
            mem_avail_bytes: mem.avail_bytes,
            swap_used_bytes: mem.swap_used_bytes,
            disk_read_bytes_per_sec: disk_read,
            disk_write_bytes_per_sec: disk_write,
            net_recv_bytes_per_sec: net_recv,
            net_sent_bytes_per_sec: net_sent,
            processes,
        })
    }

    fn disk_usage(&self, paths: Option<&[String]>) -> Result<Vec<DiskUsage>, CollectError> {
        if let Some(paths) = paths {
            return Ok(paths
                .iter()
                .map(|path| {
                    let (space, error) = match statvfs(path) {
                        Ok(space) => (Some(space), None),
                        Err(e) => {
                            debug!("statvfs({}) failed: {}", path, e);
                            (None, Some("inaccessible".to_string()))
                        }
                    };
                    DiskUsage {
                        location: path.clone(),
                        target: UsageTarget::Path,
                        device: None,
                        fstype: None,
                        space,
                        error,
                    }
                })
                .collect());
        }

        let mounts = parse_mounts(&read_proc("/proc/mounts")?);
        Ok(mounts
            .into_iter()
            .filter_map(|mount| match statvfs(&mount.mount_point) {
                Ok(space) if space.total_bytes > 0 => Some(DiskUsage {
                    location: mount.mount_point,
                    target: UsageTarget::Mount,
                    device: Some(mount.device),
                    fstype: Some(mount.fstype),
                    space: Some(space),
                    error: None,
                }),
                Ok(_) => None,
                Err(e) => {
                    debug!("statvfs({}) failed: {}", mount.mount_point, e);
                    None
                }
            })
            .collect())
    }
}

fn statvfs(path: &str) -> std::io::Result<SpaceUsage> {
    let c_path = CString::new(path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let block_size = stat.f_frsize as u64;
    let total_bytes = (stat.f_blocks as u64).saturating_mul(block_size);
    let free = (stat.f_bfree as u64).saturating_mul(block_size);
    let used = total_bytes.saturating_sub(free);
    Ok(SpaceUsage {
        total_bytes,
        free_bytes: (stat.f_bavail as u64).saturating_mul(block_size),
        percent_used: if total_bytes > 0 {
            used as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        },
    })
}

fn read_proc(path: &str) -> Result<String, CollectError> {
    fs::read_to_string(path).map_err(|source| CollectError::Read {
        path: path.to_string(),
        source,
    })
}

/// Per-second rates of two monotonically increasing counters. Zero on
/// the first reading and across counter resets.
fn rate_pair(slot: &mut Option<ByteCounter>, first: u64, second: u64) -> (u64, u64) {
    let now = Instant::now();
    let rates = match *slot {
        Some(before) => {
            let elapsed = now.duration_since(before.timestamp).as_secs_f64();
            if elapsed > 0.0 {
                (
                    (first.saturating_sub(before.first) as f64 / elapsed) as u64,
                    (second.saturating_sub(before.second) as f64 / elapsed) as u64,
                )
            } else {
                (0, 0)
            }
        }
        None => (0, 0),
    };
    *slot = Some(ByteCounter {
        first,
        second,
        timestamp: now,
    });
    rates
}

/// Aggregate `cpu` line of /proc/stat. Busy excludes idle and iowait;
/// guest time is already folded into user.
fn parse_cpu_line(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn parse_meminfo(content: &str) -> Result<MemInfo, CollectError> {
    let mut fields: HashMap<&str, u64> = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(kb) = value.parse::<u64>() {
                fields.insert(key.trim_end_matches(':'), kb * 1024);
            }
        }
    }
    let require = |key: &str| {
        fields.get(key).copied().ok_or_else(|| CollectError::Parse {
            path: "/proc/meminfo".to_string(),
            detail: format!("{} not found", key),
        })
    };
    let total_bytes = require("MemTotal")?;
    let avail_bytes = require("MemAvailable")?;
    let swap_total = fields.get("SwapTotal").copied().unwrap_or(0);
    let swap_free = fields.get("SwapFree").copied().unwrap_or(0);
    Ok(MemInfo {
        total_bytes,
        avail_bytes,
        swap_used_bytes: swap_total.saturating_sub(swap_free),
    })
}

/// Cumulative (read, written) bytes over whole block devices.
fn parse_diskstats(content: &str, is_whole_disk: impl Fn(&str) -> bool) -> (u64, u64) {
    let mut read = 0u64;
    let mut written = 0u64;
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let name = parts[2];
        if name.starts_with("loop") || name.starts_with("ram") || !is_whole_disk(name) {
            continue;
        }
        let sectors_read: u64 = parts[5].parse().unwrap_or(0);
        let sectors_written: u64 = parts[9].parse().unwrap_or(0);
        read = read.saturating_add(sectors_read * SECTOR_BYTES);
        written = written.saturating_add(sectors_written * SECTOR_BYTES);
    }
    (read, written)
}

/// Cumulative (received, sent) bytes over non-loopback interfaces.
fn parse_net_dev(content: &str) -> (u64, u64) {
    let mut recv = 0u64;
    let mut sent = 0u64;
    for line in content.lines() {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        recv = recv.saturating_add(fields[0].parse().unwrap_or(0));
        sent = sent.saturating_add(fields[8].parse().unwrap_or(0));
    }
    (recv, sent)
}

#[derive(Debug, PartialEq)]
struct MountEntry {
    device: String,
    mount_point: String,
    fstype: String,
}

/// Real filesystems from /proc/mounts, first entry per mount point.
fn parse_mounts(content: &str) -> Vec<MountEntry> {
    let mut seen = HashSet::new();
    let mut mounts = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let fstype = parts[2];
        if PSEUDO_FILESYSTEMS.contains(&fstype) {
            continue;
        }
        let mount_point = unescape_mount_field(parts[1]);
        if !seen.insert(mount_point.clone()) {
            continue;
        }
        mounts.push(MountEntry {
            device: unescape_mount_field(parts[0]),
            mount_point,
            fstype: fstype.to_string(),
        });
    }
    mounts
}

/// The kernel writes space, tab, newline and backslash as `\ooo` octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(byte) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, PartialEq)]
struct PidStat {
    name: String,
    total_ticks: u64,
    rss_pages: u64,
}

/// /proc/<pid>/stat. The comm field may contain spaces and parentheses, so
/// the remaining fields are split after the last ')'.
fn parse_pid_stat(content: &str) -> Option<PidStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let name = content.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is state (field 3); utime/stime are fields 14/15, rss is 24
    if rest.len() < 22 {
        return None;
    }
    let utime: u64 = rest[11].parse().unwrap_or(0);
    let stime: u64 = rest[12].parse().unwrap_or(0);
    let rss_pages: u64 = rest[21].parse().unwrap_or(0);
    Some(PidStat {
        name,
        total_ticks: utime + stime,
        rss_pages,
    })
}
