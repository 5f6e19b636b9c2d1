//! Per-backend pool with fast and slow sub-pools
//!
//! Capacity is split between a fast and a slow sub-pool. Each sub-pool
//! tracks the connections it owns with an atomic `open` counter that is
//! only raised by compare-and-swap against the sub-pool's capacity, so the
//! total can never exceed the backend's target. Idle connections live in a
//! per-sub-pool queue: new work takes from the back, the oldest idle
//! connections sit at the front where they can be borrowed or expired.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit::{Admission, CircuitBreaker};
use super::classifier::{OperationClassifier, SlotClass};
use super::connection::{ConnectionId, Lease, PooledConnection, ReleaseOutcome};
use super::dispatcher::{AcquireProgress, LeaseSender};
use super::stats::{PoolStats, SubPoolStats, SweepReport, WaitHistogram};
use super::{PoolConfig, PoolError};
use crate::backend::{BackendId, ConnectionFactory};

struct SubPool {
    idle: Mutex<VecDeque<PooledConnection>>,
    open: AtomicUsize,
    leased: AtomicUsize,
    waiters: Notify,
}

impl SubPool {
    fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            open: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            waiters: Notify::new(),
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LeaseRecord {
    leased_at: Instant,
    class: SlotClass,
    reported: bool,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    reused: AtomicU64,
    borrowed: AtomicU64,
    timeouts: AtomicU64,
    validation_failures: AtomicU64,
    circuit_rejections: AtomicU64,
    suspected_leaks: AtomicU64,
}

/// Pool of physical connections for one backend
pub struct BackendPool {
    id: BackendId,
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    pub(crate) circuit: CircuitBreaker,
    pub(crate) classifier: OperationClassifier,
    configured_capacity: usize,
    target: AtomicUsize,
    fast: SubPool,
    slow: SubPool,
    pending_release: AtomicUsize,
    next_id: AtomicU64,
    leases: DashMap<ConnectionId, LeaseRecord>,
    counters: Counters,
    wait_histogram: WaitHistogram,
    closed: AtomicBool,
}

impl BackendPool {
    pub(crate) fn new(
        id: BackendId,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        capacity: usize,
    ) -> Self {
        Self {
            circuit: CircuitBreaker::new(id.clone(), config.circuit.clone()),
            classifier: OperationClassifier::new(config.classifier.clone()),
            id,
            factory,
            config,
            configured_capacity: capacity,
            target: AtomicUsize::new(capacity),
            fast: SubPool::new(),
            slow: SubPool::new(),
            pending_release: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            leases: DashMap::new(),
            counters: Counters::default(),
            wait_histogram: WaitHistogram::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &BackendId {
        &self.id
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Cluster-wide capacity this backend was configured with
    pub fn configured_capacity(&self) -> usize {
        self.configured_capacity
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn classifier(&self) -> &OperationClassifier {
        &self.classifier
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn sub(&self, class: SlotClass) -> &SubPool {
        match class {
            SlotClass::Fast => &self.fast,
            SlotClass::Slow => &self.slow,
        }
    }

    /// Split the current target into (fast, slow) capacities
    pub fn capacities(&self) -> (usize, usize) {
        let target = self.target();
        if !self.config.segregation_enabled {
            return (target, 0);
        }
        let percentage = usize::from(self.config.slow_slot_percentage.min(100));
        let mut slow = target * percentage / 100;
        if slow == 0 && percentage > 0 && target >= 2 {
            slow = 1;
        }
        (target - slow, slow)
    }

    fn capacity(&self, class: SlotClass) -> usize {
        let (fast, slow) = self.capacities();
        match class {
            SlotClass::Fast => fast,
            SlotClass::Slow => slow,
        }
    }

    /// Route to the other sub-pool when the requested one has no capacity
    fn effective_class(&self, requested: SlotClass) -> SlotClass {
        if self.capacity(requested) == 0 && self.capacity(requested.other()) > 0 {
            requested.other()
        } else {
            requested
        }
    }

    /// Default acquisition deadline for a class
    pub fn default_deadline(&self, class: SlotClass) -> Duration {
        match class {
            SlotClass::Fast => self.config.fast_timeout,
            SlotClass::Slow => self.config.slow_timeout,
        }
    }

    fn recheck_interval(&self) -> Duration {
        (self.config.idle_borrow_threshold / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    fn try_reserve(&self, class: SlotClass) -> bool {
        let capacity = self.capacity(class);
        self.sub(class)
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < capacity).then_some(open + 1)
            })
            .is_ok()
    }

    fn unreserve(&self, class: SlotClass) {
        let sub = self.sub(class);
        sub.open.fetch_sub(1, Ordering::AcqRel);
        sub.waiters.notify_one();
    }

    fn take_idle(&self, class: SlotClass) -> Option<PooledConnection> {
        let sub = self.sub(class);
        let conn = sub.idle().pop_back()?;
        sub.leased.fetch_add(1, Ordering::AcqRel);
        Some(conn)
    }

    /// Take the other sub-pool's oldest idle connection if it has been idle
    /// past the borrow threshold
    fn take_borrowable(&self, from: SlotClass) -> Option<PooledConnection> {
        let sub = self.sub(from);
        let conn = {
            let mut idle = sub.idle();
            let eligible = idle
                .front()
                .is_some_and(|oldest| oldest.idle_for() >= self.config.idle_borrow_threshold);
            if eligible {
                idle.pop_front()
            } else {
                None
            }
        }?;
        sub.leased.fetch_add(1, Ordering::AcqRel);
        Some(conn)
    }

    /// Acquire a connection, waiting until one is available
    ///
    /// Runs inside the dispatcher's worker task. Returns early if the caller
    /// that requested the lease has gone away.
    pub(crate) async fn acquire_slot(
        self: &Arc<Self>,
        requested: SlotClass,
        progress: &AcquireProgress,
        caller: &mut LeaseSender,
    ) -> Result<Lease, PoolError> {
        let class = self.effective_class(requested);
        let started = Instant::now();
        let waiters = &self.sub(class).waiters;

        loop {
            let notified = waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(PoolError::ShuttingDown);
            }

            if let Some(lease) = self.try_acquire(class, progress).await? {
                self.wait_histogram.record(started.elapsed());
                return Ok(lease);
            }

            debug!(backend = %self.id, class = %class, "Waiting for a connection");
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.recheck_interval()) => {}
                _ = caller.closed() => return Err(PoolError::Abandoned(self.id.clone())),
            }
        }
    }

    async fn try_acquire(
        self: &Arc<Self>,
        class: SlotClass,
        progress: &AcquireProgress,
    ) -> Result<Option<Lease>, PoolError> {
        if let Some(conn) = self.take_idle(class) {
            return self.checkout(conn, class, false, progress).await.map(Some);
        }

        if self.try_reserve(class) {
            return self.open_new(class, progress).await.map(Some);
        }

        if let Some(conn) = self.take_borrowable(class.other()) {
            debug!(
                backend = %self.id,
                class = %class,
                connection = conn.id(),
                idle_ms = conn.idle_for().as_millis() as u64,
                "Borrowing idle connection from the other sub-pool"
            );
            return self.checkout(conn, class, true, progress).await.map(Some);
        }

        Ok(None)
    }

    /// Validate an idle connection and lease it out
    async fn checkout(
        self: &Arc<Self>,
        mut conn: PooledConnection,
        class: SlotClass,
        borrowed: bool,
        progress: &AcquireProgress,
    ) -> Result<Lease, PoolError> {
        progress.connecting();
        match conn.validate().await {
            Ok(()) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                if borrowed {
                    self.counters.borrowed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(self.lease(conn, class, borrowed))
            }
            Err(e) => {
                warn!(backend = %self.id, connection = conn.id(), error = %e, "Idle connection failed validation");
                self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                let native = conn.native_class();
                self.sub(native).leased.fetch_sub(1, Ordering::AcqRel);
                self.destroy(conn).await;
                Err(PoolError::ValidationFailure {
                    backend: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Open a new connection against an already reserved slot
    async fn open_new(self: &Arc<Self>, class: SlotClass, progress: &AcquireProgress) -> Result<Lease, PoolError> {
        progress.connecting();
        let raw = match self.factory.open(&self.id).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(backend = %self.id, error = %e, "Failed to open connection");
                self.unreserve(class);
                return Err(PoolError::ConnectionFailed {
                    backend: self.id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = PooledConnection::new(id, raw, class);
        if let Err(e) = conn.validate().await {
            warn!(backend = %self.id, connection = id, error = %e, "New connection failed validation");
            self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
            conn.close().await;
            self.unreserve(class);
            return Err(PoolError::ValidationFailure {
                backend: self.id.clone(),
                reason: e.to_string(),
            });
        }

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.sub(class).leased.fetch_add(1, Ordering::AcqRel);
        debug!(backend = %self.id, connection = id, class = %class, "Created connection");
        Ok(self.lease(conn, class, false))
    }

    fn lease(self: &Arc<Self>, mut conn: PooledConnection, class: SlotClass, borrowed: bool) -> Lease {
        conn.mark_used();
        let leased_at = Instant::now();
        self.leases.insert(
            conn.id(),
            LeaseRecord {
                leased_at,
                class,
                reported: false,
            },
        );
        Lease {
            conn: Some(conn),
            pool: self.clone(),
            class,
            borrowed,
            quarantined: false,
            leased_at,
        }
    }

    fn unaccount(&self, conn: &PooledConnection, quarantined: bool) {
        self.leases.remove(&conn.id());
        if quarantined {
            self.pending_release.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.sub(conn.native_class()).leased.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn over_capacity(&self, class: SlotClass) -> bool {
        self.sub(class).open.load(Ordering::Acquire) > self.capacity(class)
    }

    fn push_idle(&self, mut conn: PooledConnection) {
        let native = conn.native_class();
        conn.mark_idle();
        let sub = self.sub(native);
        sub.idle().push_back(conn);
        sub.waiters.notify_one();
    }

    /// Close a connection that is no longer leased or idle
    async fn destroy(&self, conn: PooledConnection) {
        let native = conn.native_class();
        conn.close().await;
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.unreserve(native);
    }

    /// Give a leased connection back to its native sub-pool
    pub(crate) async fn release(&self, mut lease: Lease, outcome: ReleaseOutcome) {
        let Some(mut conn) = lease.conn.take() else {
            return;
        };
        self.unaccount(&conn, lease.quarantined);

        let native = conn.native_class();
        let keep = match outcome {
            ReleaseOutcome::Broken => {
                self.circuit.record_failure(Admission::Normal);
                false
            }
            ReleaseOutcome::Reusable => {
                if self.is_closed() || self.over_capacity(native) {
                    false
                } else if conn.age() >= self.config.max_lifetime {
                    debug!(backend = %self.id, connection = conn.id(), "Retiring connection past max lifetime");
                    false
                } else if self.config.validate_on_release {
                    match conn.validate().await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(backend = %self.id, connection = conn.id(), error = %e, "Connection failed validation on release");
                            self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                            self.circuit.record_failure(Admission::Normal);
                            false
                        }
                    }
                } else {
                    true
                }
            }
        };

        if keep {
            if lease.borrowed {
                debug!(backend = %self.id, connection = conn.id(), native = %native, "Returning borrowed connection");
            }
            self.push_idle(conn);
        } else {
            self.destroy(conn).await;
        }
    }

    /// Return a lease that was never used, without validation
    pub(crate) fn return_unused(&self, mut lease: Lease) {
        if let Some(conn) = lease.conn.take() {
            self.unaccount(&conn, lease.quarantined);
            debug!(backend = %self.id, connection = conn.id(), "Returning connection from abandoned acquisition");
            if self.is_closed() || self.over_capacity(conn.native_class()) {
                self.discard_unaccounted(conn);
            } else {
                self.push_idle(conn);
            }
        }
    }

    /// Destroy the connection of a lease dropped without release
    pub(crate) fn discard(&self, conn: PooledConnection, quarantined: bool) {
        warn!(backend = %self.id, connection = conn.id(), "Lease dropped without release, destroying connection");
        self.unaccount(&conn, quarantined);
        self.discard_unaccounted(conn);
    }

    fn discard_unaccounted(&self, conn: PooledConnection) {
        let native = conn.native_class();
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.unreserve(native);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(conn.close());
        }
    }

    /// Hold a leased connection back from reuse while keeping it counted
    pub(crate) fn quarantine(&self, lease: &mut Lease) {
        if lease.quarantined {
            return;
        }
        if let Some(conn) = lease.conn.as_ref() {
            self.sub(conn.native_class()).leased.fetch_sub(1, Ordering::AcqRel);
            self.pending_release.fetch_add(1, Ordering::AcqRel);
            lease.quarantined = true;
            debug!(backend = %self.id, connection = conn.id(), "Connection moved to pending release");
        }
    }

    pub(crate) fn unquarantine(&self, lease: &mut Lease) {
        if !lease.quarantined {
            return;
        }
        if let Some(conn) = lease.conn.as_ref() {
            self.pending_release.fetch_sub(1, Ordering::AcqRel);
            self.sub(conn.native_class()).leased.fetch_add(1, Ordering::AcqRel);
            lease.quarantined = false;
        }
    }

    /// Change the target size; shrinking closes surplus idle connections
    /// now and surplus leased connections as they are released
    pub(crate) async fn set_target(&self, target: usize) {
        let previous = self.target.swap(target, Ordering::AcqRel);
        if target == previous {
            return;
        }
        info!(backend = %self.id, previous, target, "Pool target changed");

        if target > previous {
            self.fast.waiters.notify_waiters();
            self.slow.waiters.notify_waiters();
            return;
        }

        let mut surplus = Vec::new();
        for class in [SlotClass::Fast, SlotClass::Slow] {
            let capacity = self.capacity(class);
            let sub = self.sub(class);
            let mut excess = sub.open.load(Ordering::Acquire).saturating_sub(capacity);
            let mut idle = sub.idle();
            while excess > 0 {
                match idle.pop_front() {
                    Some(conn) => surplus.push(conn),
                    None => break,
                }
                excess -= 1;
            }
        }
        for conn in surplus {
            self.destroy(conn).await;
        }
    }

    /// Close expired idle connections and flag long-held leases
    pub(crate) async fn sweep(&self) -> SweepReport {
        let mut expired = Vec::new();
        for class in [SlotClass::Fast, SlotClass::Slow] {
            let mut idle = self.sub(class).idle();
            let mut kept = VecDeque::with_capacity(idle.len());
            for conn in idle.drain(..) {
                if conn.idle_for() >= self.config.idle_timeout || conn.age() >= self.config.max_lifetime {
                    expired.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            *idle = kept;
        }

        let mut report = SweepReport {
            expired: expired.len(),
            suspected_leaks: 0,
        };
        for conn in expired {
            debug!(backend = %self.id, connection = conn.id(), "Closing expired idle connection");
            self.destroy(conn).await;
        }

        for mut record in self.leases.iter_mut() {
            let held = record.leased_at.elapsed();
            if !record.reported && held >= self.config.leak_timeout {
                record.reported = true;
                report.suspected_leaks += 1;
                warn!(
                    backend = %self.id,
                    connection = *record.key(),
                    class = %record.class,
                    held_secs = held.as_secs(),
                    "Connection held past leak detection threshold"
                );
            }
        }
        self.counters
            .suspected_leaks
            .fetch_add(report.suspected_leaks as u64, Ordering::Relaxed);
        report
    }

    /// Stop handing out connections and close the idle ones
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.fast.waiters.notify_waiters();
        self.slow.waiters.notify_waiters();

        let mut idle = Vec::new();
        for class in [SlotClass::Fast, SlotClass::Slow] {
            idle.extend(self.sub(class).idle().drain(..));
        }
        let count = idle.len();
        for conn in idle {
            self.destroy(conn).await;
        }
        info!(backend = %self.id, closed = count, "Backend pool shut down");
    }

    pub(crate) fn record_timeout(&self) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejection(&self) {
        self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn sub_stats(&self, class: SlotClass) -> SubPoolStats {
        let sub = self.sub(class);
        SubPoolStats {
            capacity: self.capacity(class),
            open: sub.open.load(Ordering::Acquire),
            leased: sub.leased.load(Ordering::Acquire),
            idle: sub.idle().len(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let fast = self.sub_stats(SlotClass::Fast);
        let slow = self.sub_stats(SlotClass::Slow);
        PoolStats {
            backend: self.id.clone(),
            target: self.target(),
            configured_capacity: self.configured_capacity,
            leased: fast.leased + slow.leased,
            idle: fast.idle + slow.idle,
            pending_release: self.pending_release.load(Ordering::Acquire),
            total: fast.open + slow.open,
            circuit: self.circuit.stats(),
            classifier: self.classifier.stats(),
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            total_reused: self.counters.reused.load(Ordering::Relaxed),
            total_borrowed: self.counters.borrowed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
            suspected_leaks: self.counters.suspected_leaks.load(Ordering::Relaxed),
            acquisition_wait: self.wait_histogram.snapshot(),
            fast,
            slow,
        }
    }
}
