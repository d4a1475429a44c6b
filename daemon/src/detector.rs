//! Incident detection engine
//!
//! Five independent threshold rules, one [`IncidentState`] each. A rule is
//! first reduced to a [`Condition`] from one consistent read of the window,
//! then [`transition`] applies the cooldown state machine:
//!
//! ```text
//! Inactive --trigger--> Active --(immediately)--> Cooldown
//! Cooldown --cooldown elapsed, still triggered--> Active (re-fire)
//! Cooldown --cooldown elapsed, clear--> Inactive
//! ```

use crate::aggregator::{cpu_moving_average, summarize, Readiness, Summary};
use crate::config::DetectionConfig;
use crate::snapshot::{Snapshot, Timestamp, MIB};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    CpuHot,
    MemoryLow,
    SwapSpike,
    MemoryLeak,
    IoHot,
}

impl IncidentType {
    /// Evaluation order.
    pub const ALL: [IncidentType; 5] = [
        IncidentType::CpuHot,
        IncidentType::MemoryLow,
        IncidentType::SwapSpike,
        IncidentType::MemoryLeak,
        IncidentType::IoHot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IncidentType::CpuHot => "cpu_hot",
            IncidentType::MemoryLow => "memory_low",
            IncidentType::SwapSpike => "swap_spike",
            IncidentType::MemoryLeak => "memory_leak",
            IncidentType::IoHot => "io_hot",
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Inactive,
    Active,
    Cooldown,
}

/// What made a rule trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    /// Derived value compared against `threshold`.
    pub value: f64,
    pub threshold: f64,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub snapshots: Vec<Arc<Snapshot>>,
}

/// Outcome of one rule for one evaluation cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Triggered(Evidence),
    Clear,
    /// Required input is still being collected; no transition.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentState {
    pub kind: IncidentType,
    pub phase: Phase,
    pub last_fired_at: Option<Timestamp>,
    pub evidence: Option<Evidence>,
}

impl IncidentState {
    pub fn inactive(kind: IncidentType) -> Self {
        Self {
            kind,
            phase: Phase::Inactive,
            last_fired_at: None,
            evidence: None,
        }
    }
}

/// Emitted each time an incident opens or re-opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentEvent {
    pub kind: IncidentType,
    pub fired_at: Timestamp,
    /// True when re-opened from cooldown rather than from inactive.
    pub refire: bool,
    pub evidence: Evidence,
}

/// An incident that has fired and not yet returned to inactive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveIncident {
    pub kind: IncidentType,
    pub phase: Phase,
    pub fired_at: Timestamp,
    pub evidence: Evidence,
}

/// Applies one cycle of the state machine. Pure: the caller stores the
/// returned state.
pub fn transition(
    state: &IncidentState,
    condition: &Condition,
    now: Timestamp,
    cooldown_secs: f64,
) -> (IncidentState, Option<IncidentEvent>) {
    let mut next = state.clone();
    let cooled = state
        .last_fired_at
        .map_or(true, |fired| now - fired > cooldown_secs);

    match (state.phase, condition) {
        (_, Condition::Skipped) => (next, None),
        (Phase::Active, _) => {
            next.phase = Phase::Cooldown;
            next.last_fired_at.get_or_insert(now);
            (next, None)
        }
        (Phase::Inactive, Condition::Triggered(evidence)) => fire(next, evidence, now, false),
        (Phase::Cooldown, Condition::Triggered(evidence)) if cooled => {
            fire(next, evidence, now, true)
        }
        (Phase::Cooldown, Condition::Clear) if cooled => {
            next.phase = Phase::Inactive;
            (next, None)
        }
        _ => (next, None),
    }
}

fn fire(
    mut next: IncidentState,
    evidence: &Evidence,
    now: Timestamp,
    refire: bool,
) -> (IncidentState, Option<IncidentEvent>) {
    // Active is left immediately so the next tick cannot re-fire
    next.phase = Phase::Cooldown;
    next.last_fired_at = Some(now);
    next.evidence = Some(evidence.clone());
    let event = IncidentEvent {
        kind: next.kind,
        fired_at: now,
        refire,
        evidence: evidence.clone(),
    };
    (next, Some(event))
}

/// Reduces every rule to a condition, in [`IncidentType::ALL`] order.
pub fn evaluate_conditions(
    window: &[Arc<Snapshot>],
    summary: &Readiness<Summary>,
    config: &DetectionConfig,
) -> Vec<(IncidentType, Condition)> {
    IncidentType::ALL
        .iter()
        .map(|&kind| {
            let condition = match kind {
                IncidentType::CpuHot => cpu_hot(window, summary, config),
                IncidentType::MemoryLow => memory_low(window, config),
                IncidentType::SwapSpike => swap_spike(window, summary, config),
                IncidentType::MemoryLeak => memory_leak(window, config),
                IncidentType::IoHot => io_hot(window, config),
            };
            (kind, condition)
        })
        .collect()
}

fn cpu_hot(
    window: &[Arc<Snapshot>],
    summary: &Readiness<Summary>,
    config: &DetectionConfig,
) -> Condition {
    if !summary.is_ready() {
        return Condition::Skipped;
    }
    let span = config.cpu_hot_window_secs as f64;
    let Some(avg) = cpu_moving_average(window, span) else {
        return Condition::Skipped;
    };
    if avg < config.cpu_hot_percent {
        return Condition::Clear;
    }
    let cutoff = window.last().map_or(0.0, |s| s.timestamp - span);
    Condition::Triggered(Evidence {
        value: avg,
        threshold: config.cpu_hot_percent,
        detail: format!("{}s CPU average {:.1}%", config.cpu_hot_window_secs, avg),
        pid: None,
        snapshots: window
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect(),
    })
}

fn memory_low(window: &[Arc<Snapshot>], config: &DetectionConfig) -> Condition {
    let Some(latest) = window.last() else {
        return Condition::Skipped;
    };
    if latest.mem_total_bytes == 0 {
        return Condition::Skipped;
    }
    let fraction = latest.mem_avail_bytes as f64 / latest.mem_total_bytes as f64;
    if fraction > config.mem_avail_fraction {
        return Condition::Clear;
    }
    Condition::Triggered(Evidence {
        value: fraction,
        threshold: config.mem_avail_fraction,
        detail: format!(
            "{} MiB of {} MiB available",
            latest.mem_avail_bytes / MIB,
            latest.mem_total_bytes / MIB
        ),
        pid: None,
        snapshots: vec![Arc::clone(latest)],
    })
}

fn swap_spike(
    window: &[Arc<Snapshot>],
    summary: &Readiness<Summary>,
    config: &DetectionConfig,
) -> Condition {
    if !summary.is_ready() {
        return Condition::Skipped;
    }
    let lowest = window.iter().min_by_key(|s| s.swap_used_bytes);
    let (Some(latest), Some(lowest)) = (window.last(), lowest) else {
        return Condition::Skipped;
    };
    let increase = latest.swap_used_bytes.saturating_sub(lowest.swap_used_bytes);
    if increase < config.swap_delta_bytes {
        return Condition::Clear;
    }
    Condition::Triggered(Evidence {
        value: increase as f64,
        threshold: config.swap_delta_bytes as f64,
        detail: format!("swap grew {} MiB within the window", increase / MIB),
        pid: None,
        snapshots: vec![Arc::clone(lowest), Arc::clone(latest)],
    })
}

fn memory_leak(window: &[Arc<Snapshot>], config: &DetectionConfig) -> Condition {
    let Some(latest) = window.last() else {
        return Condition::Skipped;
    };
    let worst = latest
        .processes
        .iter()
        .filter(|p| {
            u64::try_from(p.rss_delta_per_minute)
                .map_or(false, |delta| delta >= config.leak_bytes_per_min)
        })
        .max_by_key(|p| p.rss_delta_per_minute);
    let Some(worst) = worst else {
        return Condition::Clear;
    };
    Condition::Triggered(Evidence {
        value: worst.rss_delta_per_minute as f64,
        threshold: config.leak_bytes_per_min as f64,
        detail: format!(
            "{} (pid {}) RSS growing {} MiB/min",
            worst.name,
            worst.pid,
            worst.rss_delta_per_minute / MIB as i64
        ),
        pid: Some(worst.pid),
        snapshots: vec![Arc::clone(latest)],
    })
}

fn io_hot(window: &[Arc<Snapshot>], config: &DetectionConfig) -> Condition {
    let Some(latest) = window.last() else {
        return Condition::Skipped;
    };
    let total = latest.disk_total_bytes_per_sec();
    if total < config.io_hot_bytes_per_sec {
        return Condition::Clear;
    }
    Condition::Triggered(Evidence {
        value: total as f64,
        threshold: config.io_hot_bytes_per_sec as f64,
        detail: format!(
            "disk read {} MiB/s, write {} MiB/s",
            latest.disk_read_bytes_per_sec / MIB,
            latest.disk_write_bytes_per_sec / MIB
        ),
        pid: None,
        snapshots: vec![Arc::clone(latest)],
    })
}

pub struct IncidentDetector {
    config: DetectionConfig,
    states: Vec<IncidentState>,
}

impl IncidentDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            states: IncidentType::ALL
                .iter()
                .map(|&kind| IncidentState::inactive(kind))
                .collect(),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Runs every rule against `window` and returns the incidents opened
    /// this cycle, in evaluation order.
    pub fn evaluate(&mut self, window: &[Arc<Snapshot>], now: Timestamp) -> Vec<IncidentEvent> {
        let summary = summarize(window, self.config.min_samples);
        let cooldown = self.config.cooldown_secs as f64;
        let mut events = Vec::new();

        for (kind, condition) in evaluate_conditions(window, &summary, &self.config) {
            let Some(state) = self.states.iter_mut().find(|s| s.kind == kind) else {
                continue;
            };
            let (next, event) = transition(state, &condition, now, cooldown);
            if let Some(event) = event {
                warn!(
                    "Incident {} opened: {} (value {:.2}, threshold {:.2})",
                    kind, event.evidence.detail, event.evidence.value, event.evidence.threshold
                );
                events.push(event);
            } else if state.phase == Phase::Cooldown && next.phase == Phase::Inactive {
                info!("Incident {} cleared", kind);
            }
            *state = next;
        }
        events
    }

    pub fn state(&self, kind: IncidentType) -> Option<&IncidentState> {
        self.states.iter().find(|s| s.kind == kind)
    }

    pub fn states(&self) -> &[IncidentState] {
        &self.states
    }

    /// Incidents that have fired and not yet returned to inactive.
    pub fn active_incidents(&self) -> Vec<ActiveIncident> {
        self.states
            .iter()
            .filter(|s| s.phase != Phase::Inactive)
            .filter_map(|s| {
                Some(ActiveIncident {
                    kind: s.kind,
                    phase: s.phase,
                    fired_at: s.last_fired_at?,
                    evidence: s.evidence.clone()?,
                })
            })
            .collect()
    }
}
