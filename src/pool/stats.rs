//! Pool statistics snapshots

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::circuit::CircuitStats;
use super::classifier::ClassifierStats;
use crate::backend::BackendId;

/// Upper bounds of the acquisition wait buckets, in milliseconds
const WAIT_BUCKETS_MS: [u64; 11] = [1, 5, 10, 50, 100, 500, 1_000, 5_000, 30_000, 60_000, 120_000];

/// Histogram of how long successful acquisitions waited
#[derive(Debug, Default)]
pub struct WaitHistogram {
    buckets: [AtomicU64; WAIT_BUCKETS_MS.len() + 1],
    total_ms: AtomicU64,
    count: AtomicU64,
}

impl WaitHistogram {
    pub fn record(&self, waited: Duration) {
        let ms = waited.as_millis() as u64;
        let index = WAIT_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(WAIT_BUCKETS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WaitHistogramSnapshot {
        let buckets = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, count)| WaitBucket {
                le_ms: WAIT_BUCKETS_MS.get(i).copied(),
                count: count.load(Ordering::Relaxed),
            })
            .collect();
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        WaitHistogramSnapshot {
            buckets,
            count,
            mean_ms: if count == 0 { 0.0 } else { total_ms as f64 / count as f64 },
        }
    }
}

/// One histogram bucket; `le_ms` is `None` for the overflow bucket
#[derive(Debug, Clone, Serialize)]
pub struct WaitBucket {
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitHistogramSnapshot {
    pub buckets: Vec<WaitBucket>,
    pub count: u64,
    pub mean_ms: f64,
}

/// Statistics for one sub-pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubPoolStats {
    /// Connections this sub-pool may own at the current target
    pub capacity: usize,

    /// Connections owned: leased, idle, pending release or being opened
    pub open: usize,

    pub leased: usize,

    pub idle: usize,
}

/// Statistics for a backend pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub backend: BackendId,

    /// Current target size
    pub target: usize,

    /// Configured cluster-wide capacity
    pub configured_capacity: usize,

    pub leased: usize,
    pub idle: usize,
    pub pending_release: usize,

    /// All connections counted against the target
    pub total: usize,

    pub fast: SubPoolStats,
    pub slow: SubPoolStats,

    pub circuit: CircuitStats,
    pub classifier: ClassifierStats,

    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_reused: u64,
    pub total_borrowed: u64,
    pub timeouts: u64,
    pub validation_failures: u64,
    pub circuit_rejections: u64,
    pub suspected_leaks: u64,

    pub acquisition_wait: WaitHistogramSnapshot,
}

/// Result of one housekeeping pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle connections closed for idle timeout or lifetime
    pub expired: usize,

    /// Leases newly flagged as suspected leaks
    pub suspected_leaks: usize,
}
