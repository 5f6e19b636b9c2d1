//! Circuit breaker implementation for fault tolerance
//!
//! Each backend owns one breaker with three states:
//! - Closed: Normal operation, acquisitions are allowed
//! - Open: Backend has failed, acquisitions fail fast until the cooldown ends
//! - HalfOpen: Exactly one probe acquisition is admitted to test recovery
//!
//! The state and the time it was entered are packed into one atomic word so
//! every transition is a single compare-and-swap.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::BackendId;

/// Circuit breaker error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open for backend {backend}, retry in {retry_in:?}")]
    CircuitOpen { backend: BackendId, retry_in: Duration },

    #[error("Circuit breaker for backend {0} is half-open and its probe is in flight")]
    ProbeInFlight(BackendId),
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Backend has failed - requests are rejected
    Open {
        /// Time left before a probe is admitted
        retry_in: Duration,

        /// Consecutive failures recorded when the circuit opened
        failure_count: u32,
    },

    /// Testing recovery - a single probe is allowed
    HalfOpen {
        /// Whether the probe is currently running
        probe_in_flight: bool,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// How long to wait before transitioning from open to half-open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// How a caller was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit is closed
    Normal,
    /// Caller is the single half-open probe
    Probe,
}

const TAG_CLOSED: u64 = 0;
const TAG_OPEN: u64 = 1;
const TAG_PROBING: u64 = 2;
const TAG_HALF_OPEN: u64 = 3;
const TAG_MASK: u64 = 0b11;

fn pack(tag: u64, since_ms: u64) -> u64 {
    (since_ms << 2) | tag
}

fn unpack(word: u64) -> (u64, u64) {
    (word & TAG_MASK, word >> 2)
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: String,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub open_count: u64,
    pub rejections: u64,
}

/// Per-backend circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: BackendId,
    config: CircuitBreakerConfig,
    epoch: Instant,

    /// Packed (state tag, entered-at millis since epoch)
    word: AtomicU64,

    consecutive_failures: AtomicU32,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    open_count: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(backend: BackendId, config: CircuitBreakerConfig) -> Self {
        Self {
            backend,
            config,
            epoch: Instant::now(),
            word: AtomicU64::new(pack(TAG_CLOSED, 0)),
            consecutive_failures: AtomicU32::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn cooldown_ms(&self) -> u64 {
        self.config.cooldown.as_millis() as u64
    }

    /// Check if a request is allowed, without waiting
    pub fn check_request(&self) -> Result<Admission, CircuitError> {
        loop {
            let current = self.word.load(Ordering::Acquire);
            let (tag, since) = unpack(current);
            match tag {
                TAG_CLOSED => return Ok(Admission::Normal),
                TAG_OPEN => {
                    let elapsed = self.now_ms().saturating_sub(since);
                    let cooldown = self.cooldown_ms();
                    if elapsed < cooldown {
                        self.rejections.fetch_add(1, Ordering::Relaxed);
                        return Err(CircuitError::CircuitOpen {
                            backend: self.backend.clone(),
                            retry_in: Duration::from_millis(cooldown - elapsed),
                        });
                    }
                    if self.try_transition(current, TAG_PROBING) {
                        info!(backend = %self.backend, "Circuit transitioning from Open to HalfOpen");
                        return Ok(Admission::Probe);
                    }
                }
                TAG_HALF_OPEN => {
                    if self.try_transition(current, TAG_PROBING) {
                        debug!(backend = %self.backend, "Admitting half-open probe");
                        return Ok(Admission::Probe);
                    }
                }
                _ => {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitError::ProbeInFlight(self.backend.clone()));
                }
            }
        }
    }

    fn try_transition(&self, current: u64, tag: u64) -> bool {
        self.word
            .compare_exchange(current, pack(tag, self.now_ms()), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a successful acquisition
    pub fn record_success(&self, admission: Admission) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        if admission == Admission::Probe {
            let current = self.word.load(Ordering::Acquire);
            if unpack(current).0 == TAG_PROBING && self.try_transition(current, TAG_CLOSED) {
                info!(backend = %self.backend, "Probe succeeded, circuit transitioning from HalfOpen to Closed");
            }
        }
    }

    /// Record a failed acquisition
    pub fn record_failure(&self, admission: Admission) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        if admission == Admission::Probe {
            let current = self.word.load(Ordering::Acquire);
            if unpack(current).0 == TAG_PROBING && self.try_transition(current, TAG_OPEN) {
                self.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %self.backend, "Probe failed, reopening circuit");
            }
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            backend = %self.backend,
            consecutive_failures = failures,
            threshold = self.config.failure_threshold,
            "Acquisition failed"
        );
        if failures < self.config.failure_threshold {
            return;
        }

        loop {
            let current = self.word.load(Ordering::Acquire);
            if unpack(current).0 != TAG_CLOSED {
                return;
            }
            if self.try_transition(current, TAG_OPEN) {
                self.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend = %self.backend,
                    consecutive_failures = failures,
                    cooldown_ms = self.cooldown_ms(),
                    "Circuit transitioning from Closed to Open"
                );
                return;
            }
        }
    }

    /// Give up a probe slot without judging the backend
    pub fn release_probe(&self) {
        let current = self.word.load(Ordering::Acquire);
        if unpack(current).0 == TAG_PROBING {
            self.try_transition(current, TAG_HALF_OPEN);
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        let (tag, since) = unpack(self.word.load(Ordering::Acquire));
        match tag {
            TAG_CLOSED => CircuitState::Closed,
            TAG_OPEN => CircuitState::Open {
                retry_in: Duration::from_millis(
                    self.cooldown_ms().saturating_sub(self.now_ms().saturating_sub(since)),
                ),
                failure_count: self.consecutive_failures.load(Ordering::Acquire),
            },
            TAG_PROBING => CircuitState::HalfOpen { probe_in_flight: true },
            _ => CircuitState::HalfOpen { probe_in_flight: false },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Get statistics
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state().name().to_string(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Manually reset the circuit to Closed
    pub fn reset(&self) {
        self.word.store(pack(TAG_CLOSED, self.now_ms()), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        info!(backend = %self.backend, "Circuit manually reset to Closed");
    }
}
