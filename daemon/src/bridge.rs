//! Read-only history queries exposed to the advisory layer

use crate::aggregator::{summarize, trend, Readiness, Summary, TrendMetric, TrendStats};
use crate::collector::{DiskUsage, SystemCollector};
use crate::config::Config;
use crate::detector::{ActiveIncident, IncidentDetector};
use crate::error::QueryError;
use crate::protocol::{MetricSelection, Response, ToolCall};
use crate::snapshot::{unix_now, ProcessSample, Snapshot, SnapshotSummary, Timestamp};
use crate::window::WindowReader;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendReport {
    pub window_minutes: f64,
    pub snapshots_analyzed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<TrendStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<TrendStats>,
}

/// Which per-snapshot ranking a process appeared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Listing {
    Cpu,
    Memory,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOccurrence {
    pub timestamp: Timestamp,
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub resident_bytes: u64,
    pub rss_delta_per_minute: i64,
    pub listed_in: Listing,
}

pub struct QueryBridge {
    window: WindowReader,
    detector: Arc<Mutex<IncidentDetector>>,
    min_samples: usize,
    max_processes: usize,
    near_tolerance_secs: f64,
    history_limit: usize,
    clock: fn() -> Timestamp,
    collector: Option<Arc<dyn SystemCollector>>,
}

impl QueryBridge {
    pub fn new(window: WindowReader, detector: Arc<Mutex<IncidentDetector>>, config: &Config) -> Self {
        Self {
            window,
            detector,
            min_samples: config.detection.min_samples,
            max_processes: config.sampling.max_processes,
            near_tolerance_secs: config.query.near_tolerance_secs as f64,
            history_limit: config.query.process_history_limit,
            clock: unix_now,
            collector: None,
        }
    }

    /// Source for live queries that bypass the window (disk headroom).
    pub fn with_collector(mut self, collector: Arc<dyn SystemCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Replaces the wall clock used for time-relative queries.
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    pub fn current_summary(&self) -> Readiness<Summary> {
        summarize(&self.window.all(), self.min_samples)
    }

    pub fn top_by_cpu(&self, n: usize) -> Readiness<Vec<ProcessSample>> {
        self.from_latest(|s| s.top_by_cpu(n))
    }

    pub fn top_by_memory(&self, n: usize) -> Readiness<Vec<ProcessSample>> {
        self.from_latest(|s| s.top_by_memory(n))
    }

    fn from_latest<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> Readiness<T> {
        match self.window.latest() {
            Some(latest) => Readiness::Ready(f(&latest)),
            None => Readiness::InsufficientData {
                available: 0,
                required: 1,
            },
        }
    }

    /// The newest `last_n` snapshots, newest last.
    pub fn recent_snapshots(
        &self,
        last_n: usize,
        include_processes: bool,
    ) -> Readiness<Vec<SnapshotSummary>> {
        let recent = self.window.snapshots_since(None, last_n);
        if recent.is_empty() {
            return Readiness::InsufficientData {
                available: 0,
                required: 1,
            };
        }
        Readiness::Ready(
            recent
                .iter()
                .map(|s| s.summary(include_processes))
                .collect(),
        )
    }

    /// Snapshots within the lookup tolerance of `minutes_ago`, oldest
    /// first, at most `limit`.
    pub fn snapshots_near(&self, minutes_ago: f64, limit: usize) -> Readiness<Vec<SnapshotSummary>> {
        let window = self.window.all();
        if window.is_empty() {
            return Readiness::InsufficientData {
                available: 0,
                required: 1,
            };
        }
        let target = (self.clock)() - minutes_ago * 60.0;
        Readiness::Ready(
            window
                .iter()
                .filter(|s| (s.timestamp - target).abs() < self.near_tolerance_secs)
                .take(limit)
                .map(|s| s.summary(false))
                .collect(),
        )
    }

    pub fn analyze_trend(&self, metric: MetricSelection, window_minutes: f64) -> Readiness<TrendReport> {
        let window = self.window.all();
        let cutoff = (self.clock)() - window_minutes * 60.0;
        let stats = |m: TrendMetric| trend(&window, cutoff, m, self.min_samples);

        let (cpu, memory) = match metric {
            MetricSelection::Cpu => (Some(stats(TrendMetric::Cpu)), None),
            MetricSelection::Memory => (None, Some(stats(TrendMetric::Memory))),
            MetricSelection::Both => (
                Some(stats(TrendMetric::Cpu)),
                Some(stats(TrendMetric::Memory)),
            ),
        };
        // Both metrics see the same sub-window, so readiness agrees
        for r in cpu.iter().chain(memory.iter()) {
            if let Readiness::InsufficientData {
                available,
                required,
            } = r
            {
                return Readiness::InsufficientData {
                    available: *available,
                    required: *required,
                };
            }
        }
        let cpu = cpu.and_then(Readiness::ready);
        let memory = memory.and_then(Readiness::ready);
        let snapshots_analyzed = cpu
            .as_ref()
            .or(memory.as_ref())
            .map_or(0, |stats| stats.samples);
        Readiness::Ready(TrendReport {
            window_minutes,
            snapshots_analyzed,
            cpu,
            memory,
        })
    }

    /// Every retained appearance of `name` (optionally only `pid`), one
    /// record per snapshot and pid. Keeps the most recent matches up to the
    /// history limit, oldest first.
    pub fn process_history(&self, name: &str, pid: Option<u32>) -> Readiness<Vec<ProcessOccurrence>> {
        let window = self.window.all();
        if window.is_empty() {
            return Readiness::InsufficientData {
                available: 0,
                required: 1,
            };
        }
        let mut matches = Vec::new();
        for snapshot in &window {
            let cpu_ranked: HashSet<u32> = snapshot
                .top_by_cpu(self.max_processes)
                .iter()
                .map(|p| p.pid)
                .collect();
            let mem_ranked: HashSet<u32> = snapshot
                .top_by_memory(self.max_processes)
                .iter()
                .map(|p| p.pid)
                .collect();
            let mut seen = HashSet::new();
            for p in &snapshot.processes {
                if p.name != name || pid.map_or(false, |pid| p.pid != pid) || !seen.insert(p.pid) {
                    continue;
                }
                let listed_in = match (cpu_ranked.contains(&p.pid), mem_ranked.contains(&p.pid)) {
                    (true, true) => Listing::Both,
                    (false, true) => Listing::Memory,
                    _ => Listing::Cpu,
                };
                matches.push(ProcessOccurrence {
                    timestamp: snapshot.timestamp,
                    pid: p.pid,
                    name: p.name.clone(),
                    cpu_percent: p.cpu_percent,
                    resident_bytes: p.resident_bytes,
                    rss_delta_per_minute: p.rss_delta_per_minute,
                    listed_in,
                });
            }
        }
        let skip = matches.len().saturating_sub(self.history_limit);
        Readiness::Ready(matches.split_off(skip))
    }

    /// Headroom for `paths` in the given order, or the `top_n` fullest
    /// mounts when no paths are named.
    pub async fn disk_usage(
        &self,
        paths: Option<Vec<String>>,
        top_n: usize,
    ) -> Result<Vec<DiskUsage>, QueryError> {
        let collector = self
            .collector
            .clone()
            .ok_or(QueryError::Unavailable("disk usage"))?;
        let paths = paths.filter(|p| !p.is_empty());
        let listing_mounts = paths.is_none();
        let task = tokio::task::spawn_blocking(move || collector.disk_usage(paths.as_deref()));
        let mut usage = match task.await {
            Ok(result) => result?,
            Err(e) => {
                error!("Disk usage task failed: {}", e);
                return Err(QueryError::Unavailable("disk usage"));
            }
        };
        if listing_mounts {
            usage.sort_by(|a, b| {
                let used = |u: &DiskUsage| u.space.map_or(0.0, |s| s.percent_used);
                used(b).total_cmp(&used(a))
            });
            usage.truncate(top_n);
        }
        Ok(usage)
    }

    pub async fn active_incidents(&self) -> Vec<ActiveIncident> {
        self.detector.lock().await.active_incidents()
    }

    /// Validates and runs one tool call.
    pub async fn dispatch(&self, call: ToolCall) -> Response {
        let tool = call.name();
        debug!("Dispatching tool {}", tool);
        match self.run(call).await {
            Ok(response) => response,
            Err(e) => Response::error(Some(tool), e),
        }
    }

    async fn run(&self, call: ToolCall) -> Result<Response, QueryError> {
        let tool = call.name();
        let response = match call {
            ToolCall::GetCurrentSummary => respond(tool, self.current_summary()),
            ToolCall::GetTopCpuProcesses { n } => {
                respond(tool, self.top_by_cpu(positive("n", n)?))
            }
            ToolCall::GetTopMemoryProcesses { n } => {
                respond(tool, self.top_by_memory(positive("n", n)?))
            }
            ToolCall::GetSnapshotHistory {
                last_n,
                minutes_ago,
                include_processes,
            } => {
                let last_n = positive("last_n", last_n)?;
                match minutes_ago {
                    Some(minutes) => {
                        let minutes = non_negative("minutes_ago", minutes)?;
                        respond(tool, self.snapshots_near(minutes as f64, last_n))
                    }
                    None => respond(tool, self.recent_snapshots(last_n, include_processes)),
                }
            }
            ToolCall::AnalyzeTrends {
                metric,
                window_minutes,
            } => {
                let minutes = positive("window_minutes", window_minutes)?;
                respond(tool, self.analyze_trend(metric, minutes as f64))
            }
            ToolCall::FindProcessHistory { process_name, pid } => {
                if process_name.trim().is_empty() {
                    return Err(QueryError::InvalidParameter {
                        name: "process_name",
                        detail: "must not be empty".to_string(),
                    });
                }
                respond(tool, self.process_history(&process_name, pid))
            }
            ToolCall::ListActiveIncidents => {
                respond(tool, Readiness::Ready(self.active_incidents().await))
            }
            ToolCall::CheckDiskUsage { paths, top_n } => {
                let top_n = positive("top_n", top_n)?;
                respond(tool, Readiness::Ready(self.disk_usage(paths, top_n).await?))
            }
        };
        Ok(response)
    }
}

fn positive(name: &'static str, value: i64) -> Result<usize, QueryError> {
    if value <= 0 {
        return Err(QueryError::InvalidParameter {
            name,
            detail: format!("must be positive, got {}", value),
        });
    }
    usize::try_from(value).map_err(|_| QueryError::InvalidParameter {
        name,
        detail: format!("out of range: {}", value),
    })
}

fn non_negative(name: &'static str, value: i64) -> Result<u64, QueryError> {
    u64::try_from(value).map_err(|_| QueryError::InvalidParameter {
        name,
        detail: format!("must not be negative, got {}", value),
    })
}

fn respond<T: Serialize>(tool: &str, result: Readiness<T>) -> Response {
    match result {
        Readiness::Ready(data) => match serde_json::to_value(&data) {
            Ok(data) => Response::Result {
                tool: tool.to_string(),
                data,
            },
            Err(e) => Response::error(Some(tool), e),
        },
        Readiness::InsufficientData {
            available,
            required,
        } => Response::InsufficientData {
            tool: tool.to_string(),
            available,
            required,
        },
    }
}
