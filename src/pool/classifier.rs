//! Fast/slow workload classification
//!
//! Operations are identified by a stable fingerprint of their text. Each
//! fingerprint keeps an exponential moving average of its execution time;
//! an operation is slow when its average is at least twice the average
//! across all tracked operations.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Sub-pool a request is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotClass {
    Fast,
    Slow,
}

impl SlotClass {
    pub fn other(self) -> Self {
        match self {
            SlotClass::Fast => SlotClass::Slow,
            SlotClass::Slow => SlotClass::Fast,
        }
    }
}

impl fmt::Display for SlotClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotClass::Fast => write!(f, "fast"),
            SlotClass::Slow => write!(f, "slow"),
        }
    }
}

/// Stable identifier of an operation's text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the operation with whitespace collapsed and case folded
    pub fn of(operation: &str) -> Self {
        let normalized = operation
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        let digest = Sha256::digest(normalized.as_bytes());
        Fingerprint(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Configuration for the classifier
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Maximum fingerprints tracked before the least recently used are evicted
    pub max_tracked: usize,

    /// Minimum interval between overall average recomputations
    pub update_interval: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_tracked: 10_000,
            update_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Record {
    average_ms: f64,
    samples: u64,
    last_seen: u64,
}

/// Classifier statistics
#[derive(Debug, Clone, Serialize)]
pub struct ClassifierStats {
    pub tracked: usize,
    pub overall_average_ms: f64,
    pub slow_operations: usize,
}

/// Rolling per-fingerprint timing statistics
#[derive(Debug)]
pub struct OperationClassifier {
    config: ClassifierConfig,
    records: DashMap<Fingerprint, Record>,
    overall_average_bits: AtomicU64,
    clock: AtomicU64,
    last_update: Mutex<Option<Instant>>,
}

impl OperationClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            overall_average_bits: AtomicU64::new(0f64.to_bits()),
            clock: AtomicU64::new(0),
            last_update: Mutex::new(None),
        }
    }

    /// Overall average across tracked operations
    pub fn overall_average_ms(&self) -> f64 {
        f64::from_bits(self.overall_average_bits.load(Ordering::Relaxed))
    }

    /// Classify an operation from its recorded history
    pub fn classify(&self, fingerprint: &Fingerprint) -> SlotClass {
        let overall = self.overall_average_ms();
        match self.records.get(fingerprint) {
            Some(record) if overall > 1.0 && record.average_ms >= overall * 2.0 => SlotClass::Slow,
            _ => SlotClass::Fast,
        }
    }

    /// Record one execution of an operation
    pub fn record(&self, fingerprint: &Fingerprint, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        let mut is_new = false;
        self.records
            .entry(fingerprint.clone())
            .and_modify(|record| {
                record.average_ms = (record.average_ms * 4.0 + sample) / 5.0;
                record.samples += 1;
                record.last_seen = tick;
            })
            .or_insert_with(|| {
                is_new = true;
                Record {
                    average_ms: sample,
                    samples: 1,
                    last_seen: tick,
                }
            });

        if is_new && self.records.len() > self.config.max_tracked {
            self.evict();
        }

        if is_new || self.update_due() {
            self.recompute_overall();
        }
    }

    fn update_due(&self) -> bool {
        let mut last = self.last_update.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if at.elapsed() < self.config.update_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    fn recompute_overall(&self) {
        let (sum, count) = self
            .records
            .iter()
            .fold((0.0, 0usize), |(sum, count), entry| (sum + entry.average_ms, count + 1));
        let overall = if count == 0 { 0.0 } else { sum / count as f64 };
        self.overall_average_bits.store(overall.to_bits(), Ordering::Relaxed);
    }

    /// Drop the least recently seen eighth of the tracked operations
    fn evict(&self) {
        let mut ages: Vec<(u64, Fingerprint)> = self
            .records
            .iter()
            .map(|entry| (entry.last_seen, entry.key().clone()))
            .collect();
        ages.sort_unstable_by_key(|(seen, _)| *seen);

        let excess = self.records.len().saturating_sub(self.config.max_tracked);
        let count = excess.max(self.config.max_tracked / 8).max(1);
        for (_, fingerprint) in ages.into_iter().take(count) {
            self.records.remove(&fingerprint);
        }
        debug!(evicted = count, tracked = self.records.len(), "Evicted least recently used operations");
    }

    pub fn stats(&self) -> ClassifierStats {
        let overall = self.overall_average_ms();
        let slow_operations = if overall > 1.0 {
            self.records
                .iter()
                .filter(|entry| entry.average_ms >= overall * 2.0)
                .count()
        } else {
            0
        };
        ClassifierStats {
            tracked: self.records.len(),
            overall_average_ms: overall,
            slow_operations,
        }
    }
}
