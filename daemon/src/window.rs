//! Bounded FIFO of recent snapshots
//!
//! The store has exactly one [`WindowWriter`] (owned by the sampler) and any
//! number of cloneable [`WindowReader`]s. Snapshots are shared as
//! `Arc<Snapshot>`, so a reader's copy of the window is a vector of pointer
//! clones taken under a short read lock and never observes a partially
//! written entry.

use crate::snapshot::{Snapshot, Timestamp};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::warn;

struct Ring {
    buf: VecDeque<Arc<Snapshot>>,
    capacity: usize,
    appended: u64,
}

type Shared = Arc<RwLock<Ring>>;

fn read(shared: &Shared) -> RwLockReadGuard<'_, Ring> {
    shared.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(shared: &Shared) -> RwLockWriteGuard<'_, Ring> {
    shared.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WindowStore;

impl WindowStore {
    /// Creates an empty window holding at most `capacity` snapshots.
    pub fn with_capacity(capacity: usize) -> (WindowWriter, WindowReader) {
        let capacity = capacity.max(1);
        let shared = Arc::new(RwLock::new(Ring {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            appended: 0,
        }));
        let (generation_tx, generation_rx) = watch::channel(0);
        let reader = WindowReader {
            shared: Arc::clone(&shared),
            generation: generation_rx,
        };
        let writer = WindowWriter {
            shared,
            generation: generation_tx,
        };
        (writer, reader)
    }
}

/// The single append handle. Deliberately not `Clone`.
pub struct WindowWriter {
    shared: Shared,
    generation: watch::Sender<u64>,
}

impl WindowWriter {
    /// Appends a snapshot, evicting the oldest entry when full.
    ///
    /// A timestamp older than the newest retained one (wall clock stepped
    /// back) is clamped so the window stays non-decreasing.
    pub fn append(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        let (stored, generation) = {
            let mut ring = write(&self.shared);
            if let Some(last) = ring.buf.back() {
                if snapshot.timestamp < last.timestamp {
                    warn!(
                        "Snapshot timestamp {} precedes {}, clamping",
                        snapshot.timestamp, last.timestamp
                    );
                    snapshot.timestamp = last.timestamp;
                }
            }
            if ring.buf.len() == ring.capacity {
                ring.buf.pop_front();
            }
            let stored = Arc::new(snapshot);
            ring.buf.push_back(Arc::clone(&stored));
            ring.appended += 1;
            (stored, ring.appended)
        };
        self.generation.send_replace(generation);
        stored
    }

    pub fn reader(&self) -> WindowReader {
        WindowReader {
            shared: Arc::clone(&self.shared),
            generation: self.generation.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct WindowReader {
    shared: Shared,
    generation: watch::Receiver<u64>,
}

impl WindowReader {
    /// The whole window, oldest first.
    pub fn all(&self) -> Vec<Arc<Snapshot>> {
        read(&self.shared).buf.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        read(&self.shared).buf.back().cloned()
    }

    /// The newest `limit` snapshots (optionally only those containing
    /// `pid`), oldest first.
    pub fn snapshots_since(&self, pid: Option<u32>, limit: usize) -> Vec<Arc<Snapshot>> {
        let ring = read(&self.shared);
        let mut picked: Vec<Arc<Snapshot>> = ring
            .buf
            .iter()
            .rev()
            .filter(|s| pid.map_or(true, |pid| s.process(pid).is_some()))
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    /// Snapshots taken at or after `cutoff`, oldest first.
    pub fn since(&self, cutoff: Timestamp) -> Vec<Arc<Snapshot>> {
        read(&self.shared)
            .buf
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.shared).buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        read(&self.shared).capacity
    }

    /// Total appends since creation, including evicted entries.
    pub fn total_appended(&self) -> u64 {
        read(&self.shared).appended
    }

    /// Receiver that changes once per append.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.clone()
    }
}
