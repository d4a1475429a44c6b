mod common;

use common::{arcs, process, snapshot, GIB};
use std::sync::Arc;
use sysdoctor_daemon::config::DetectionConfig;
use sysdoctor_daemon::detector::{
    transition, Condition, Evidence, IncidentDetector, IncidentState, IncidentType, Phase,
};
use sysdoctor_daemon::snapshot::{Snapshot, MIB};

fn eager_config() -> DetectionConfig {
    DetectionConfig {
        min_samples: 1,
        ..DetectionConfig::default()
    }
}

fn evidence() -> Evidence {
    Evidence {
        value: 95.0,
        threshold: 85.0,
        detail: "test".to_string(),
        pid: None,
        snapshots: Vec::new(),
    }
}

/// Feeds one snapshot per second through a rolling window.
fn run_ticks(
    detector: &mut IncidentDetector,
    ticks: impl Iterator<Item = Snapshot>,
) -> Vec<(f64, IncidentType)> {
    let mut window: Vec<Arc<Snapshot>> = Vec::new();
    let mut fired = Vec::new();
    for s in ticks {
        let now = s.timestamp;
        window.push(Arc::new(s));
        if window.len() > 120 {
            window.remove(0);
        }
        for event in detector.evaluate(&window, now) {
            fired.push((event.fired_at, event.kind));
        }
    }
    fired
}

#[test]
fn test_sustained_cpu_fires_once_per_cooldown() {
    let mut detector = IncidentDetector::new(eager_config());
    let fired = run_ticks(&mut detector, (0..=1801).map(|t| snapshot(t as f64, 95.0)));
    assert_eq!(
        fired,
        vec![(0.0, IncidentType::CpuHot), (901.0, IncidentType::CpuHot)]
    );
}

#[test]
fn test_cooldown_boundary_is_strict() {
    let cooled = IncidentState {
        kind: IncidentType::CpuHot,
        phase: Phase::Cooldown,
        last_fired_at: Some(0.0),
        evidence: Some(evidence()),
    };
    let triggered = Condition::Triggered(evidence());

    let (next, event) = transition(&cooled, &triggered, 900.0, 900.0);
    assert!(event.is_none());
    assert_eq!(next.phase, Phase::Cooldown);
    assert_eq!(next.last_fired_at, Some(0.0));

    let (next, event) = transition(&cooled, &triggered, 901.0, 900.0);
    let event = event.unwrap();
    assert!(event.refire);
    assert_eq!(event.fired_at, 901.0);
    assert_eq!(next.last_fired_at, Some(901.0));
}

#[test]
fn test_transition_from_inactive_fires() {
    let state = IncidentState::inactive(IncidentType::MemoryLeak);
    let (next, event) = transition(&state, &Condition::Triggered(evidence()), 10.0, 900.0);
    let event = event.unwrap();
    assert!(!event.refire);
    assert_eq!(event.kind, IncidentType::MemoryLeak);
    assert_eq!(next.phase, Phase::Cooldown);
    assert_eq!(next.evidence, Some(evidence()));

    let (unchanged, event) = transition(&state, &Condition::Clear, 10.0, 900.0);
    assert!(event.is_none());
    assert_eq!(unchanged, state);
}

#[test]
fn test_active_moves_to_cooldown() {
    let state = IncidentState {
        kind: IncidentType::IoHot,
        phase: Phase::Active,
        last_fired_at: Some(5.0),
        evidence: Some(evidence()),
    };
    let (next, event) = transition(&state, &Condition::Triggered(evidence()), 6.0, 900.0);
    assert!(event.is_none());
    assert_eq!(next.phase, Phase::Cooldown);
    assert_eq!(next.last_fired_at, Some(5.0));
}

#[test]
fn test_skipped_condition_changes_nothing() {
    let state = IncidentState {
        kind: IncidentType::CpuHot,
        phase: Phase::Cooldown,
        last_fired_at: Some(0.0),
        evidence: Some(evidence()),
    };
    let (next, event) = transition(&state, &Condition::Skipped, 5_000.0, 900.0);
    assert!(event.is_none());
    assert_eq!(next, state);
}

#[test]
fn test_cooldown_clears_only_after_elapsed() {
    let mut detector = IncidentDetector::new(eager_config());
    let hot = arcs(vec![snapshot(0.0, 95.0)]);
    assert_eq!(detector.evaluate(&hot, 0.0).len(), 1);

    let calm = arcs(vec![snapshot(500.0, 5.0)]);
    detector.evaluate(&calm, 500.0);
    assert_eq!(
        detector.state(IncidentType::CpuHot).unwrap().phase,
        Phase::Cooldown
    );

    let calm = arcs(vec![snapshot(901.0, 5.0)]);
    assert!(detector.evaluate(&calm, 901.0).is_empty());
    assert_eq!(
        detector.state(IncidentType::CpuHot).unwrap().phase,
        Phase::Inactive
    );
    assert!(detector.active_incidents().is_empty());
}

#[test]
fn test_insufficient_data_skips_window_rules() {
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    let mut window: Vec<Snapshot> = (0..4).map(|t| snapshot(t as f64, 99.0)).collect();
    assert!(detector.evaluate(&arcs(window.clone()), 3.0).is_empty());
    assert_eq!(
        detector.state(IncidentType::CpuHot).unwrap().phase,
        Phase::Inactive
    );

    window.push(snapshot(4.0, 99.0));
    let events = detector.evaluate(&arcs(window), 4.0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IncidentType::CpuHot);
    assert_eq!(events[0].evidence.snapshots.len(), 5);
}

#[test]
fn test_memory_leak_fires_with_offending_pid() {
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    let mut latest = snapshot(60.0, 10.0);
    latest.processes.push(process(7, "leaky", 1.0, 400 * MIB));
    latest.processes[0].rss_delta_per_minute = (300 * MIB) as i64;
    latest.processes.push(process(8, "steady", 1.0, 400 * MIB));

    let window = arcs(vec![snapshot(0.0, 10.0), latest]);
    let events = detector.evaluate(&window, 60.0);
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.kind, IncidentType::MemoryLeak);
    assert!(!event.refire);
    assert_eq!(event.evidence.pid, Some(7));
    assert_eq!(event.evidence.value, (300 * MIB) as f64);

    let active = detector.active_incidents();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].kind, IncidentType::MemoryLeak);
    assert_eq!(active[0].fired_at, 60.0);
}

#[test]
fn test_slow_growth_is_not_a_leak() {
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    let mut latest = snapshot(60.0, 10.0);
    latest.processes.push(process(7, "growing", 1.0, 400 * MIB));
    latest.processes[0].rss_delta_per_minute = (100 * MIB) as i64;
    assert!(detector.evaluate(&arcs(vec![latest]), 60.0).is_empty());
}

#[test]
fn test_all_rules_fire_in_order() {
    let mut detector = IncidentDetector::new(eager_config());
    let before = snapshot(0.0, 95.0);
    let mut latest = snapshot(1.0, 95.0);
    latest.mem_avail_bytes = GIB;
    latest.swap_used_bytes = 512 * MIB;
    latest.disk_read_bytes_per_sec = 100 * MIB;
    latest.disk_write_bytes_per_sec = 100 * MIB;
    latest.processes.push(process(7, "leaky", 1.0, GIB));
    latest.processes[0].rss_delta_per_minute = (300 * MIB) as i64;

    let events = detector.evaluate(&arcs(vec![before, latest]), 1.0);
    let kinds: Vec<IncidentType> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, IncidentType::ALL.to_vec());
    assert_eq!(detector.active_incidents().len(), 5);
}

#[test]
fn test_memory_low_boundary() {
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    let mut s = snapshot(0.0, 10.0);
    // Exactly 10% available
    s.mem_total_bytes = 10 * GIB;
    s.mem_avail_bytes = GIB;
    let events = detector.evaluate(&arcs(vec![s]), 0.0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IncidentType::MemoryLow);
}

#[test]
fn test_swap_spike_needs_growth_within_window() {
    let mut detector = IncidentDetector::new(eager_config());
    let mut high = snapshot(0.0, 10.0);
    high.swap_used_bytes = 2 * GIB;
    let mut still_high = snapshot(1.0, 10.0);
    still_high.swap_used_bytes = 2 * GIB;
    // Large but flat swap is not a spike
    assert!(detector.evaluate(&arcs(vec![high, still_high]), 1.0).is_empty());

    let mut low = snapshot(0.0, 10.0);
    low.swap_used_bytes = GIB;
    let mut grown = snapshot(1.0, 10.0);
    grown.swap_used_bytes = GIB + 300 * MIB;
    let events = detector.evaluate(&arcs(vec![low, grown]), 1.0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IncidentType::SwapSpike);
    assert_eq!(events[0].evidence.snapshots.len(), 2);
}

#[test]
fn test_io_hot_threshold() {
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    let mut s = snapshot(0.0, 10.0);
    s.disk_read_bytes_per_sec = 100 * MIB;
    s.disk_write_bytes_per_sec = 49 * MIB;
    assert!(detector.evaluate(&arcs(vec![s.clone()]), 0.0).is_empty());

    s.disk_write_bytes_per_sec = 50 * MIB;
    let events = detector.evaluate(&arcs(vec![s]), 1.0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IncidentType::IoHot);
}

#[test]
fn test_empty_window_fires_nothing() {
    let mut detector = IncidentDetector::new(eager_config());
    assert!(detector.evaluate(&[], 0.0).is_empty());
    assert!(detector
        .states()
        .iter()
        .all(|s| s.phase == Phase::Inactive));
}

#[test]
fn test_memory_low_refires_after_cooldown() {
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    let low = |t: f64| {
        let mut s = snapshot(t, 10.0);
        s.mem_avail_bytes = GIB;
        arcs(vec![s])
    };

    let first = detector.evaluate(&low(0.0), 0.0);
    assert_eq!(first.len(), 1);
    assert!(!first[0].refire);
    assert_eq!(
        detector.state(IncidentType::MemoryLow).unwrap().phase,
        Phase::Cooldown
    );

    for t in [1.0, 450.0, 900.0] {
        assert!(detector.evaluate(&low(t), t).is_empty());
    }

    let refired = detector.evaluate(&low(901.0), 901.0);
    assert_eq!(refired.len(), 1);
    assert_eq!(refired[0].kind, IncidentType::MemoryLow);
    assert!(refired[0].refire);
    assert_eq!(refired[0].fired_at, 901.0);
}

#[test]
fn test_leak_scenario_from_sampled_growth() {
    use sysdoctor_daemon::collector::RawProcess;
    use sysdoctor_daemon::sampler::build_snapshot;

    let mut before = snapshot(0.0, 10.0);
    before.processes.push(process(42, "leaky", 1.0, 200 * MIB));
    let window = arcs(vec![before]);

    let mut raw = common::raw_sample(60.0, Vec::new());
    raw.processes.push(RawProcess {
        pid: 42,
        name: "leaky".to_string(),
        cpu_percent: 1.0,
        resident_bytes: 500 * MIB,
    });
    let after = build_snapshot(raw, &window, 25);
    assert_eq!(after.process(42).unwrap().rss_delta_per_minute, (300 * MIB) as i64);

    let mut window = window;
    window.push(Arc::new(after));
    let mut detector = IncidentDetector::new(DetectionConfig::default());
    assert_eq!(
        detector.state(IncidentType::MemoryLeak).unwrap().phase,
        Phase::Inactive
    );
    let events = detector.evaluate(&window, 60.0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IncidentType::MemoryLeak);
    assert_eq!(events[0].evidence.pid, Some(42));
}
