//! OS readings for one sampling tick (reads /proc on Linux)

mod linux;

pub use linux::LinuxCollector;

use crate::error::CollectError;
use crate::snapshot::Timestamp;
use serde::Serialize;
use std::sync::Arc;

/// One row of the process table before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProcess {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub resident_bytes: u64,
}

/// Everything the OS reported for one tick. Rates are per second.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub timestamp: Timestamp,
    pub cpu_total_percent: f64,
    pub mem_total_bytes: u64,
    pub mem_avail_bytes: u64,
    pub swap_used_bytes: u64,
    pub disk_read_bytes_per_sec: u64,
    pub disk_write_bytes_per_sec: u64,
    pub net_recv_bytes_per_sec: u64,
    pub net_sent_bytes_per_sec: u64,
    pub processes: Vec<RawProcess>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTarget {
    /// A caller-named path, reported for the filesystem holding it.
    Path,
    Mount,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpaceUsage {
    pub total_bytes: u64,
    /// Space available to unprivileged users.
    pub free_bytes: u64,
    pub percent_used: f64,
}

/// Filesystem headroom for one location. `space` is absent and `error`
/// set when the location could not be queried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub location: String,
    #[serde(rename = "type")]
    pub target: UsageTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<SpaceUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Source of raw samples. Implementations may block on I/O; the sampler
/// runs them on the blocking pool under a timeout.
pub trait SystemCollector: Send + Sync {
    /// Reads one tick. An `Err` skips the tick; partial failures should be
    /// defaulted inside the implementation.
    fn collect(&self) -> Result<RawSample, CollectError>;

    /// Headroom for each of `paths`, in the given order, or for every
    /// mounted real filesystem when `paths` is `None`. Unreadable paths
    /// yield an entry with `error` set; unreadable mounts are left out.
    fn disk_usage(&self, paths: Option<&[String]>) -> Result<Vec<DiskUsage>, CollectError>;
}

impl<C: SystemCollector + ?Sized> SystemCollector for Arc<C> {
    fn collect(&self) -> Result<RawSample, CollectError> {
        (**self).collect()
    }

    fn disk_usage(&self, paths: Option<&[String]>) -> Result<Vec<DiskUsage>, CollectError> {
        (**self).disk_usage(paths)
    }
}
