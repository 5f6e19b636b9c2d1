//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Per-backend connection pools split into fast and slow sub-pools
//! - Circuit breaker pattern for fault tolerance
//! - Deadline-bounded acquisition through a dispatcher
//! - Housekeeping for idle expiry, lifetime expiry and leak detection

pub mod circuit;
pub mod classifier;
pub mod connection;
mod dispatcher;
pub mod stats;
mod subpool;

pub use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use classifier::{ClassifierConfig, Fingerprint, OperationClassifier, SlotClass};
pub use connection::{ConnectionId, Lease, PooledConnection, ReleaseOutcome};
pub use stats::{PoolStats, SubPoolStats, SweepReport, WaitHistogramSnapshot};
pub use subpool::BackendPool;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendId, ConnectionFactory};

/// Error types for connection pool operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out after {waited:?} waiting for a {class} connection to backend {backend}")]
    AcquisitionTimeout {
        backend: BackendId,
        class: SlotClass,
        waited: Duration,
    },

    #[error("Circuit breaker is open for backend {backend}, retry in {retry_in:?}")]
    CircuitOpen { backend: BackendId, retry_in: Duration },

    #[error("Connection to backend {backend} failed validation: {reason}")]
    ValidationFailure { backend: BackendId, reason: String },

    #[error("Failed to connect to backend {backend}: {reason}")]
    ConnectionFailed { backend: BackendId, reason: String },

    #[error("Backend not found: {0}")]
    BackendNotFound(BackendId),

    #[error("Lease for backend {0} no longer holds a connection")]
    LeaseReleased(BackendId),

    #[error("Acquisition for backend {0} was abandoned by its caller")]
    Abandoned(BackendId),

    #[error("Pool is shutting down")]
    ShuttingDown,
}

impl From<CircuitError> for PoolError {
    fn from(err: CircuitError) -> Self {
        match err {
            CircuitError::CircuitOpen { backend, retry_in } => PoolError::CircuitOpen { backend, retry_in },
            CircuitError::ProbeInFlight(backend) => PoolError::CircuitOpen {
                backend,
                retry_in: Duration::ZERO,
            },
        }
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Default cluster-wide capacity per backend
    pub max_connections: usize,

    /// Acquisition deadline for fast requests
    pub fast_timeout: Duration,

    /// Acquisition deadline for slow requests
    pub slow_timeout: Duration,

    /// Share of the target reserved for slow operations
    pub slow_slot_percentage: u8,

    /// When disabled every request uses the fast sub-pool
    pub segregation_enabled: bool,

    /// Idle time after which the other sub-pool may borrow a connection
    pub idle_borrow_threshold: Duration,

    /// Maximum idle time before closing a connection
    pub idle_timeout: Duration,

    /// Maximum age of a connection
    pub max_lifetime: Duration,

    /// Lease duration after which a connection is reported as a suspected leak
    pub leak_timeout: Duration,

    /// Validate connections when they are released
    pub validate_on_release: bool,

    /// Interval between housekeeping passes
    pub housekeeping_interval: Duration,

    pub circuit: CircuitBreakerConfig,

    pub classifier: ClassifierConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            fast_timeout: Duration::from_secs(60),
            slow_timeout: Duration::from_secs(120),
            slow_slot_percentage: 20,
            segregation_enabled: true,
            idle_borrow_threshold: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            leak_timeout: Duration::from_secs(300),
            validate_on_release: true,
            housekeeping_interval: Duration::from_secs(30),
            circuit: CircuitBreakerConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

/// Connection pool manager for all backends
pub struct ConnectionPool {
    backends: DashMap<BackendId, Arc<BackendPool>>,
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool manager
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            backends: DashMap::new(),
            factory,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a backend; `capacity` overrides the configured default
    pub fn register_backend(&self, backend_id: BackendId, capacity: Option<usize>) {
        let capacity = capacity.unwrap_or(self.config.max_connections);
        let pool = BackendPool::new(backend_id.clone(), self.factory.clone(), self.config.clone(), capacity);
        let (fast, slow) = pool.capacities();
        self.backends.insert(backend_id.clone(), Arc::new(pool));
        info!(backend = %backend_id, capacity, fast, slow, "Registered backend");
    }

    pub fn backend(&self, backend_id: &str) -> Result<Arc<BackendPool>, PoolError> {
        self.backends
            .get(backend_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PoolError::BackendNotFound(backend_id.to_string()))
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.backends.contains_key(backend_id)
    }

    /// Registered backend ids, sorted
    pub fn backend_ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.backends.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Classify an operation against its backend's history
    pub fn classify(&self, backend_id: &str, fingerprint: &Fingerprint) -> SlotClass {
        self.backends
            .get(backend_id)
            .map(|pool| pool.classifier.classify(fingerprint))
            .unwrap_or(SlotClass::Fast)
    }

    /// Feed an execution time back into the classifier
    pub fn record_execution(&self, backend_id: &str, fingerprint: &Fingerprint, elapsed: Duration) {
        if let Some(pool) = self.backends.get(backend_id) {
            pool.classifier.record(fingerprint, elapsed);
        }
    }

    /// Acquire a connection
    ///
    /// Fails immediately with `CircuitOpen` when the backend's circuit is
    /// open, otherwise waits at most `deadline` (or the class default).
    pub async fn acquire(
        &self,
        backend_id: &str,
        hint: SlotClass,
        deadline: Option<Duration>,
    ) -> Result<Lease, PoolError> {
        let pool = self.backend(backend_id)?;
        if pool.is_closed() {
            return Err(PoolError::ShuttingDown);
        }
        let deadline = deadline.unwrap_or_else(|| pool.default_deadline(hint));
        dispatcher::acquire_bounded(pool, hint, deadline).await
    }

    /// Give a lease back to its pool
    pub async fn release(&self, lease: Lease, outcome: ReleaseOutcome) {
        let pool = lease.pool.clone();
        pool.release(lease, outcome).await;
    }

    /// Hold a leased connection back from reuse until it is released
    pub fn quarantine(&self, lease: &mut Lease) {
        let pool = lease.pool.clone();
        pool.quarantine(lease);
    }

    pub fn unquarantine(&self, lease: &mut Lease) {
        let pool = lease.pool.clone();
        pool.unquarantine(lease);
    }

    /// Change a backend's target size
    pub async fn set_target(&self, backend_id: &str, target: usize) -> Result<(), PoolError> {
        let pool = self.backend(backend_id)?;
        pool.set_target(target).await;
        Ok(())
    }

    /// Get statistics for a specific backend
    pub fn get_stats(&self, backend_id: &str) -> Option<PoolStats> {
        self.backends.get(backend_id).map(|pool| pool.stats())
    }

    /// Get statistics for all backends, sorted by backend id
    pub fn get_all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.backends.iter().map(|pool| pool.stats()).collect();
        stats.sort_by(|a, b| a.backend.cmp(&b.backend));
        stats
    }

    /// Run one housekeeping pass over every backend
    pub async fn sweep(&self) -> SweepReport {
        let pools: Vec<Arc<BackendPool>> = self.backends.iter().map(|entry| entry.value().clone()).collect();
        let mut report = SweepReport::default();
        for pool in pools {
            let backend_report = pool.sweep().await;
            report.expired += backend_report.expired;
            report.suspected_leaks += backend_report.suspected_leaks;
        }
        if report.expired > 0 || report.suspected_leaks > 0 {
            debug!(expired = report.expired, suspected_leaks = report.suspected_leaks, "Housekeeping pass");
        }
        report
    }

    /// Start the background housekeeping task
    pub fn start_housekeeping(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.clone();
        let interval = self.config.housekeeping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Housekeeping task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Close idle connections everywhere and refuse new acquisitions
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<BackendPool>> = self.backends.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            let stats = pool.stats();
            if stats.leased + stats.pending_release > 0 {
                warn!(
                    backend = %pool.id(),
                    leased = stats.leased,
                    pending_release = stats.pending_release,
                    "Shutting down with connections still out"
                );
            }
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn pool_with(config: PoolConfig) -> (ConnectionPool, MemoryBackend) {
        let backend = MemoryBackend::new();
        let pool = ConnectionPool::new(config, Arc::new(backend.clone()));
        pool.register_backend("db1".to_string(), None);
        (pool, backend)
    }

    fn small_config(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            fast_timeout: Duration::from_millis(200),
            slow_timeout: Duration::from_millis(400),
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.fast_timeout, Duration::from_secs(60));
        assert_eq!(config.slow_timeout, Duration::from_secs(120));
        assert_eq!(config.slow_slot_percentage, 20);
        assert_eq!(config.idle_borrow_threshold, Duration::from_secs(10));
        assert_eq!(config.circuit.failure_threshold, 3);
    }

    #[tokio::test]
    async fn test_capacity_split() {
        let (pool, _) = pool_with(small_config(10));
        let backend = pool.backend("db1").unwrap();
        assert_eq!(backend.capacities(), (8, 2));

        pool.set_target("db1", 3).await.unwrap();
        assert_eq!(backend.capacities(), (2, 1));

        pool.set_target("db1", 1).await.unwrap();
        assert_eq!(backend.capacities(), (1, 0));
    }

    #[tokio::test]
    async fn test_segregation_disabled() {
        let (pool, _) = pool_with(PoolConfig {
            segregation_enabled: false,
            ..small_config(4)
        });
        let backend = pool.backend("db1").unwrap();
        assert_eq!(backend.capacities(), (4, 0));

        let lease = pool.acquire("db1", SlotClass::Slow, None).await.unwrap();
        assert_eq!(pool.get_stats("db1").unwrap().fast.leased, 1);
        pool.release(lease, ReleaseOutcome::Reusable).await;
    }

    #[tokio::test]
    async fn test_acquire_and_release_reuses_connection() {
        let (pool, backend) = pool_with(small_config(4));

        let lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        let first = lease.connection_id();
        pool.release(lease, ReleaseOutcome::Reusable).await;

        let lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        assert_eq!(lease.connection_id(), first);
        pool.release(lease, ReleaseOutcome::Reusable).await;

        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_reused, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
        assert_eq!(backend.stats("db1").opened, 1);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let (pool, _) = pool_with(small_config(4));
        let err = pool.acquire("nope", SlotClass::Fast, None).await.unwrap_err();
        assert!(matches!(err, PoolError::BackendNotFound(_)));
    }

    #[tokio::test]
    async fn test_broken_release_destroys_connection() {
        let (pool, backend) = pool_with(small_config(4));

        let lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        pool.release(lease, ReleaseOutcome::Broken).await;

        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.total_destroyed, 1);
        assert_eq!(backend.stats("db1").closed, 1);
    }

    #[tokio::test]
    async fn test_release_validation_failure_destroys_then_recreates() {
        let (pool, backend) = pool_with(small_config(4));

        let lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        backend.set_healthy("db1", false);
        pool.release(lease, ReleaseOutcome::Reusable).await;
        assert_eq!(pool.get_stats("db1").unwrap().total, 0);

        backend.set_healthy("db1", true);
        let lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        pool.release(lease, ReleaseOutcome::Reusable).await;
        assert_eq!(pool.get_stats("db1").unwrap().total_created, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out_without_tripping_circuit() {
        let (pool, _) = pool_with(small_config(1));

        let held = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        let err = pool
            .acquire("db1", SlotClass::Fast, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AcquisitionTimeout { .. }));

        let backend = pool.backend("db1").unwrap();
        assert!(backend.circuit().is_closed());
        assert_eq!(backend.stats().timeouts, 1);
        pool.release(held, ReleaseOutcome::Reusable).await;
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_release() {
        let (pool, _) = pool_with(small_config(1));
        let pool = Arc::new(pool);

        let held = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("db1", SlotClass::Fast, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held, ReleaseOutcome::Reusable).await;

        let lease = waiter.await.unwrap().unwrap();
        pool.release(lease, ReleaseOutcome::Reusable).await;
    }

    #[tokio::test]
    async fn test_unresponsive_open_counts_as_failure() {
        let (pool, backend) = pool_with(small_config(2));
        backend.set_open_delay("db1", Duration::from_secs(5));

        let err = pool
            .acquire("db1", SlotClass::Fast, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AcquisitionTimeout { .. }));
        assert_eq!(pool.backend("db1").unwrap().circuit().stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_quarantine_keeps_capacity_counted() {
        let (pool, _) = pool_with(small_config(2));

        let mut lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        pool.quarantine(&mut lease);
        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.pending_release, 1);
        assert_eq!(stats.total, 1);

        pool.release(lease, ReleaseOutcome::Reusable).await;
        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.pending_release, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_capacity() {
        let (pool, _) = pool_with(small_config(1));

        let lease = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        drop(lease);

        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.total, 0);
        let lease = pool.acquire("db1", SlotClass::Fast, Some(Duration::from_millis(100))).await.unwrap();
        pool.release(lease, ReleaseOutcome::Reusable).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_idle_and_flags_leaks() {
        let (pool, _) = pool_with(PoolConfig {
            idle_timeout: Duration::from_secs(60),
            leak_timeout: Duration::from_secs(120),
            ..small_config(4)
        });

        let idle = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        let held = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
        pool.release(idle, ReleaseOutcome::Reusable).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = pool.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.suspected_leaks, 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = pool.sweep().await;
        assert_eq!(report.suspected_leaks, 1);
        assert_eq!(pool.sweep().await.suspected_leaks, 0);
        assert_eq!(pool.get_stats("db1").unwrap().suspected_leaks, 1);

        pool.release(held, ReleaseOutcome::Reusable).await;
    }

    #[tokio::test]
    async fn test_shrink_trims_idle_and_retires_on_release() {
        let (pool, _) = pool_with(PoolConfig {
            segregation_enabled: false,
            ..small_config(4)
        });

        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire("db1", SlotClass::Fast, None).await.unwrap());
        }
        for lease in leases.drain(..2) {
            pool.release(lease, ReleaseOutcome::Reusable).await;
        }

        pool.set_target("db1", 1).await.unwrap();
        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.leased, 2);

        for lease in leases {
            pool.release(lease, ReleaseOutcome::Reusable).await;
        }
        let stats = pool.get_stats("db1").unwrap();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let (pool, _) = pool_with(small_config(2));
        pool.shutdown().await;
        let err = pool.acquire("db1", SlotClass::Fast, None).await.unwrap_err();
        assert!(matches!(err, PoolError::ShuttingDown));
    }
}
