//! Session registry
//!
//! Maps session ids to individually locked sessions and reaps sessions whose
//! clients went away without closing.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Session, SessionError, SessionId, SessionInfo, SessionKind};
use crate::pool::ConnectionPool;
use crate::txn::TransactionCoordinator;

/// Session registry configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are closed by the reaper
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Shared, individually locked session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Registry of open sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    pool: Arc<ConnectionPool>,
    coordinator: Arc<TransactionCoordinator>,
    config: SessionConfig,
    closing: AtomicBool,
}

impl SessionRegistry {
    pub fn new(pool: Arc<ConnectionPool>, coordinator: Arc<TransactionCoordinator>, config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            pool,
            coordinator,
            config,
            closing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a local session against a backend
    pub fn open(&self, backend: &str) -> Result<SessionId, SessionError> {
        self.open_with(backend, SessionKind::Local)
    }

    pub fn open_with(&self, backend: &str, kind: SessionKind) -> Result<SessionId, SessionError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SessionError::ShuttingDown);
        }
        if !self.pool.contains(backend) {
            return Err(SessionError::UnknownBackend(backend.to_string()));
        }

        let session = Session::new(backend.to_string(), kind);
        let id = session.id();
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        debug!(session = %id, backend = %backend, ?kind, "Session opened");
        Ok(id)
    }

    pub fn lookup(&self, id: &SessionId) -> Result<SessionHandle, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    /// Close a session, rolling back or handing over its transaction
    pub async fn close(&self, id: &SessionId) -> Result<(), SessionError> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        let mut session = handle.lock().await;
        self.coordinator.close_session(&mut session).await;
        debug!(session = %id, operations = session.info().operations, "Session closed");
        Ok(())
    }

    /// Close sessions idle beyond the inactivity timeout; sessions in use
    /// are skipped
    pub async fn sweep_inactive(&self) -> usize {
        let candidates: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut reaped = 0;
        for (id, handle) in candidates {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if session.idle_for() < self.config.inactivity_timeout {
                continue;
            }
            if self.sessions.remove(&id).is_none() {
                continue;
            }
            warn!(
                session = %id,
                backend = %session.backend(),
                idle_secs = session.idle_for().as_secs(),
                "Closing inactive session"
            );
            self.coordinator.close_session(&mut session).await;
            reaped += 1;
        }
        reaped
    }

    /// Start the background reaper for idle sessions and abandoned branches
    pub fn start_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.sweep_inactive().await;
                        let abandoned = registry.coordinator.sweep_held().await;
                        if reaped > 0 || abandoned > 0 {
                            info!(sessions = reaped, branches = abandoned, "Reaper pass");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Session reaper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Refuse new sessions and close every open one
    pub async fn drain(&self) -> usize {
        self.closing.store(true, Ordering::Release);
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id).await.is_ok() {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(sessions = closed, "Drained open sessions");
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Info for every session not currently in use
    pub fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        let mut infos: Vec<SessionInfo> = handles
            .iter()
            .filter_map(|handle| handle.try_lock().ok().map(|session| session.info()))
            .collect();
        infos.sort_by_key(|info| info.opened_at);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Payload};
    use crate::pool::{PoolConfig, SlotClass};
    use crate::txn::TxConfig;

    fn registry(config: SessionConfig) -> SessionRegistry {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), Arc::new(MemoryBackend::new())));
        pool.register_backend("db1".to_string(), None);
        let coordinator = Arc::new(TransactionCoordinator::new(pool.clone(), TxConfig::default()));
        SessionRegistry::new(pool, coordinator, config)
    }

    #[tokio::test]
    async fn test_open_lookup_close() {
        let registry = registry(SessionConfig::default());
        let id = registry.open("db1").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&id).unwrap().lock().await.backend(), "db1");

        registry.close(&id).await.unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.lookup(&id), Err(SessionError::UnknownSession(_))));
        assert!(matches!(registry.close(&id).await, Err(SessionError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_open_unknown_backend() {
        let registry = registry(SessionConfig::default());
        assert!(matches!(registry.open("nope"), Err(SessionError::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn test_close_rolls_back_local_transaction() {
        let registry = registry(SessionConfig::default());
        let id = registry.open("db1").unwrap();
        {
            let handle = registry.lookup(&id).unwrap();
            let mut session = handle.lock().await;
            registry.coordinator.begin(&mut session, None, None).await.unwrap();
            registry
                .coordinator
                .execute(&mut session, "UPDATE", &Payload::new(), SlotClass::Fast, None)
                .await
                .unwrap();
        }
        assert_eq!(registry.pool.get_stats("db1").unwrap().leased, 1);

        registry.close(&id).await.unwrap();
        let stats = registry.pool.get_stats("db1").unwrap();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_inactive_and_skips_busy() {
        let registry = registry(SessionConfig {
            inactivity_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        });
        let idle = registry.open("db1").unwrap();
        let busy = registry.open("db1").unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let handle = registry.lookup(&busy).unwrap();
        let guard = handle.lock().await;

        assert_eq!(registry.sweep_inactive().await, 1);
        assert!(registry.lookup(&idle).is_err());
        assert!(registry.lookup(&busy).is_ok());
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_session_alive() {
        let registry = registry(SessionConfig {
            inactivity_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        });
        let id = registry.open("db1").unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        registry.lookup(&id).unwrap().lock().await.touch();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(registry.sweep_inactive().await, 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_refuses_new_sessions() {
        let registry = registry(SessionConfig::default());
        registry.open("db1").unwrap();
        registry.open_with("db1", SessionKind::Distributed).unwrap();
        assert_eq!(registry.list().len(), 2);

        assert_eq!(registry.drain().await, 2);
        assert!(registry.is_empty());
        assert!(matches!(registry.open("db1"), Err(SessionError::ShuttingDown)));
    }
}
