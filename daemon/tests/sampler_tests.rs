mod common;

use common::{arcs, process, raw_process, raw_sample, snapshot, ScriptedCollector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysdoctor_daemon::collector::{DiskUsage, RawSample, SystemCollector};
use sysdoctor_daemon::config::SamplingConfig;
use sysdoctor_daemon::error::CollectError;
use sysdoctor_daemon::sampler::{build_snapshot, rank_processes, rss_delta_per_minute, Sampler};
use sysdoctor_daemon::snapshot::{unix_now, MIB};
use sysdoctor_daemon::window::WindowStore;
use tokio::sync::watch;

fn fast_config() -> SamplingConfig {
    SamplingConfig {
        rate_hz: 100.0,
        window_secs: 10,
        max_processes: 3,
        tick_timeout_ms: 500,
    }
}

#[test]
fn test_rank_processes_merges_without_duplicates() {
    let raw = vec![
        raw_process(1, "hog", 80.0, 900 * MIB),
        raw_process(2, "spinner", 60.0, MIB),
        raw_process(3, "cache", 0.5, 800 * MIB),
        raw_process(4, "idle", 0.1, MIB),
    ];
    let ranked = rank_processes(&raw, 2);
    let pids: Vec<u32> = ranked.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![1, 2, 3]);
}

#[test]
fn test_rank_processes_small_table() {
    let raw = vec![raw_process(1, "only", 1.0, MIB)];
    assert_eq!(rank_processes(&raw, 25).len(), 1);
    assert!(rank_processes(&[], 25).is_empty());
}

#[test]
fn test_rss_delta_defaults_to_zero_for_new_pid() {
    let window = arcs(vec![snapshot(0.0, 10.0)]);
    assert_eq!(rss_delta_per_minute(&window, 42, 500 * MIB, 60.0), 0);
    assert_eq!(rss_delta_per_minute(&[], 42, 500 * MIB, 60.0), 0);
}

#[test]
fn test_rss_delta_uses_earliest_retained_sample() {
    let mut first = snapshot(0.0, 10.0);
    first.processes.push(process(7, "leaky", 1.0, 100 * MIB));
    let mut second = snapshot(30.0, 10.0);
    second.processes.push(process(7, "leaky", 1.0, 300 * MIB));
    let window = arcs(vec![first, second]);
    assert_eq!(
        rss_delta_per_minute(&window, 7, 400 * MIB, 60.0),
        (300 * MIB) as i64
    );
}

#[test]
fn test_rss_delta_can_be_negative() {
    let mut first = snapshot(0.0, 10.0);
    first.processes.push(process(7, "shrinking", 1.0, 400 * MIB));
    let window = arcs(vec![first]);
    assert_eq!(
        rss_delta_per_minute(&window, 7, 100 * MIB, 120.0),
        -((150 * MIB) as i64)
    );
}

#[test]
fn test_build_snapshot_fills_deltas() {
    let mut earlier = snapshot(0.0, 10.0);
    earlier.processes.push(process(7, "leaky", 1.0, 100 * MIB));
    let window = arcs(vec![earlier]);

    let raw = raw_sample(
        60.0,
        vec![
            raw_process(7, "leaky", 2.0, 400 * MIB),
            raw_process(8, "fresh", 1.0, 50 * MIB),
        ],
    );
    let built = build_snapshot(raw, &window, 25);
    assert_eq!(built.timestamp, 60.0);
    assert_eq!(built.cpu_total_percent, 20.0);
    assert_eq!(built.process(7).unwrap().rss_delta_per_minute, (300 * MIB) as i64);
    assert_eq!(built.process(8).unwrap().rss_delta_per_minute, 0);
}

#[tokio::test]
async fn test_tick_appends_snapshot() {
    let (writer, reader) = WindowStore::with_capacity(10);
    let sampler = Sampler::new(ScriptedCollector::steady(35.0), writer, &fast_config());
    let stored = sampler.tick().await.unwrap();
    assert_eq!(stored.cpu_total_percent, 35.0);
    assert_eq!(reader.len(), 1);
    assert_eq!(reader.latest().unwrap().processes.len(), 1);
}

#[tokio::test]
async fn test_failed_tick_is_skipped() {
    let (writer, reader) = WindowStore::with_capacity(10);
    let collector = ScriptedCollector::new(vec![
        Ok(raw_sample(0.0, vec![])),
        Err("MemTotal missing".to_string()),
        Ok(raw_sample(0.0, vec![])),
    ]);
    let sampler = Sampler::new(collector, writer, &fast_config());
    assert!(sampler.tick().await.is_some());
    assert!(sampler.tick().await.is_none());
    assert_eq!(reader.len(), 1);
    // The next tick succeeds again
    assert!(sampler.tick().await.is_some());
    assert_eq!(reader.len(), 2);
}

#[tokio::test]
async fn test_slow_tick_times_out() {
    let (writer, reader) = WindowStore::with_capacity(10);
    let collector = ScriptedCollector::steady(10.0).with_delay(Duration::from_millis(300));
    let config = SamplingConfig {
        tick_timeout_ms: 20,
        ..fast_config()
    };
    let sampler = Sampler::new(collector, writer, &config);
    assert!(sampler.tick().await.is_none());
    assert!(reader.is_empty());
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let (writer, reader) = WindowStore::with_capacity(1000);
    let sampler = Sampler::new(ScriptedCollector::steady(10.0), writer, &fast_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(sampler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sampler did not stop")
        .unwrap();

    let sampled = reader.len();
    assert!(sampled > 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reader.len(), sampled);
}

/// Blocks for `stall` on its first call only, counting every call started.
struct StallingCollector {
    started: Arc<AtomicUsize>,
    stall: Duration,
}

impl SystemCollector for StallingCollector {
    fn collect(&self) -> Result<RawSample, CollectError> {
        if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(self.stall);
        }
        Ok(raw_sample(unix_now(), vec![]))
    }

    fn disk_usage(&self, _paths: Option<&[String]>) -> Result<Vec<DiskUsage>, CollectError> {
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_collection_is_not_stacked() {
    let started = Arc::new(AtomicUsize::new(0));
    let collector = StallingCollector {
        started: Arc::clone(&started),
        stall: Duration::from_millis(400),
    };
    let (writer, reader) = WindowStore::with_capacity(10);
    let config = SamplingConfig {
        tick_timeout_ms: 20,
        ..fast_config()
    };
    let sampler = Sampler::new(collector, writer, &config);

    for _ in 0..30 {
        assert!(sampler.tick().await.is_none());
    }
    // Only the stuck read ever started
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert!(reader.is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(sampler.tick().await.is_some());
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(reader.len(), 1);
}
