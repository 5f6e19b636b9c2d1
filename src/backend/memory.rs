//! In-process backend used by tests and the `simulate` command
//!
//! Each backend id gets its own shared state: health flags, injected
//! failures, latency, and the branch table. Branch state is shared between
//! all connections to the same backend, so a branch prepared on one
//! connection can be recovered or committed from another.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{
    BackendConnection, BackendError, BackendId, ConnectionFactory, IsolationLevel, Payload,
    PrepareVote, Xid,
};

/// Branch state as the backend sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    Active,
    Suspended,
    Ended { failed: bool },
    Prepared,
    Heuristic,
}

/// Counters exposed for assertions
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub opened: u64,
    pub closed: u64,
    pub executed: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub branch_commits: u64,
    pub branch_rollbacks: u64,
}

#[derive(Debug)]
struct BackendState {
    reachable: bool,
    healthy: bool,
    xa_available: bool,
    refuse_opens: u32,
    latency: Duration,
    open_delay: Duration,
    prepare_vote: PrepareVote,
    branches: BTreeMap<Xid, BranchState>,
    stats: MemoryStats,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            reachable: true,
            healthy: true,
            xa_available: true,
            refuse_opens: 0,
            latency: Duration::ZERO,
            open_delay: Duration::ZERO,
            prepare_vote: PrepareVote::Ok,
            branches: BTreeMap::new(),
            stats: MemoryStats::default(),
        }
    }
}

type SharedState = Arc<Mutex<BackendState>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory producing in-memory connections
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    backends: Arc<DashMap<BackendId, SharedState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, backend: &str) -> SharedState {
        self.backends
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BackendState::default())))
            .clone()
    }

    /// Unhealthy backends accept connections that then fail validation
    pub fn set_healthy(&self, backend: &str, healthy: bool) {
        lock(&self.state(backend)).healthy = healthy;
    }

    /// Unreachable backends refuse every open
    pub fn set_reachable(&self, backend: &str, reachable: bool) {
        lock(&self.state(backend)).reachable = reachable;
    }

    /// Make the transaction manager verbs fail as unavailable
    pub fn set_xa_available(&self, backend: &str, available: bool) {
        lock(&self.state(backend)).xa_available = available;
    }

    /// Refuse the next `count` opens
    pub fn refuse_next_opens(&self, backend: &str, count: u32) {
        lock(&self.state(backend)).refuse_opens = count;
    }

    /// Delay applied to every statement
    pub fn set_latency(&self, backend: &str, latency: Duration) {
        lock(&self.state(backend)).latency = latency;
    }

    /// Delay applied to every open
    pub fn set_open_delay(&self, backend: &str, delay: Duration) {
        lock(&self.state(backend)).open_delay = delay;
    }

    pub fn set_prepare_vote(&self, backend: &str, vote: PrepareVote) {
        lock(&self.state(backend)).prepare_vote = vote;
    }

    /// Record a branch as prepared without going through a connection,
    /// as if a previous coordinator had prepared it before going away
    pub fn inject_prepared(&self, backend: &str, xid: Xid) {
        lock(&self.state(backend)).branches.insert(xid, BranchState::Prepared);
    }

    /// Force the next commit or rollback of `xid` to report a heuristic outcome
    pub fn mark_heuristic(&self, backend: &str, xid: &Xid) {
        let state = self.state(backend);
        let mut guard = lock(&state);
        if let Some(branch) = guard.branches.get_mut(xid) {
            *branch = BranchState::Heuristic;
        }
    }

    /// Branches currently known to the backend
    pub fn branch_count(&self, backend: &str) -> usize {
        lock(&self.state(backend)).branches.len()
    }

    pub fn stats(&self, backend: &str) -> MemoryStats {
        lock(&self.state(backend)).stats.clone()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBackend {
    async fn open(&self, backend: &BackendId) -> Result<Box<dyn BackendConnection>, BackendError> {
        let state = self.state(backend);
        let delay = lock(&state).open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut guard = lock(&state);
            if !guard.reachable {
                return Err(BackendError::Connect(format!("{} is unreachable", backend)));
            }
            if guard.refuse_opens > 0 {
                guard.refuse_opens -= 1;
                return Err(BackendError::Connect(format!("{} refused the connection", backend)));
            }
            guard.stats.opened += 1;
        }

        debug!(backend = %backend, "Opened in-memory connection");
        Ok(Box::new(MemoryConnection {
            backend: backend.clone(),
            state,
            in_transaction: false,
            closed: false,
        }))
    }
}

/// One in-memory physical connection
pub struct MemoryConnection {
    backend: BackendId,
    state: SharedState,
    in_transaction: bool,
    closed: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Invalid("connection closed".to_string()));
        }
        Ok(())
    }

    fn check_xa(&self) -> Result<(), BackendError> {
        self.check_open()?;
        if !lock(&self.state).xa_available {
            return Err(BackendError::Unavailable(format!(
                "{} transaction manager unavailable",
                self.backend
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn validate(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        if lock(&self.state).healthy {
            Ok(())
        } else {
            Err(BackendError::Invalid(format!("{} failed validation", self.backend)))
        }
    }

    async fn execute(&mut self, sql: &str, _params: &Payload) -> Result<Payload, BackendError> {
        self.check_open()?;
        let latency = {
            let mut guard = lock(&self.state);
            if !guard.healthy {
                return Err(BackendError::Invalid(format!("{} is unhealthy", self.backend)));
            }
            guard.stats.executed += 1;
            guard.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(Bytes::copy_from_slice(sql.as_bytes()))
    }

    async fn begin(&mut self, _isolation: Option<IsolationLevel>) -> Result<(), BackendError> {
        self.check_open()?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        if self.in_transaction {
            lock(&self.state).stats.commits += 1;
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        if self.in_transaction {
            lock(&self.state).stats.rollbacks += 1;
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn xa_start(&mut self, xid: &Xid, resume: bool) -> Result<(), BackendError> {
        self.check_xa()?;
        let mut guard = lock(&self.state);
        match (guard.branches.get(xid).copied(), resume) {
            (None, false) => {
                guard.branches.insert(xid.clone(), BranchState::Active);
                Ok(())
            }
            (Some(BranchState::Suspended), true) | (Some(BranchState::Ended { failed: false }), true) => {
                guard.branches.insert(xid.clone(), BranchState::Active);
                Ok(())
            }
            (None, true) => Err(BackendError::UnknownBranch(xid.to_string())),
            (Some(_), _) => Err(BackendError::Other(format!("branch {} already exists", xid))),
        }
    }

    async fn xa_end(&mut self, xid: &Xid, suspend: bool, failed: bool) -> Result<(), BackendError> {
        self.check_xa()?;
        let mut guard = lock(&self.state);
        let branch = guard
            .branches
            .get_mut(xid)
            .ok_or_else(|| BackendError::UnknownBranch(xid.to_string()))?;
        *branch = if suspend {
            BranchState::Suspended
        } else {
            BranchState::Ended { failed }
        };
        Ok(())
    }

    async fn prepare(&mut self, xid: &Xid) -> Result<PrepareVote, BackendError> {
        self.check_xa()?;
        let mut guard = lock(&self.state);
        match guard.branches.get(xid).copied() {
            None => Err(BackendError::UnknownBranch(xid.to_string())),
            Some(BranchState::Ended { failed: true }) => {
                guard.branches.remove(xid);
                guard.stats.branch_rollbacks += 1;
                Err(BackendError::RollbackOnly(xid.to_string()))
            }
            Some(_) => {
                let vote = guard.prepare_vote;
                if vote == PrepareVote::ReadOnly {
                    guard.branches.remove(xid);
                } else {
                    guard.branches.insert(xid.clone(), BranchState::Prepared);
                }
                Ok(vote)
            }
        }
    }

    async fn commit_branch(&mut self, xid: &Xid, _one_phase: bool) -> Result<(), BackendError> {
        self.check_xa()?;
        let mut guard = lock(&self.state);
        match guard.branches.get(xid).copied() {
            None => Err(BackendError::UnknownBranch(xid.to_string())),
            Some(BranchState::Heuristic) => {
                Err(BackendError::Heuristic(format!("{} was heuristically rolled back", xid)))
            }
            Some(_) => {
                guard.branches.remove(xid);
                guard.stats.branch_commits += 1;
                Ok(())
            }
        }
    }

    async fn rollback_branch(&mut self, xid: &Xid) -> Result<(), BackendError> {
        self.check_xa()?;
        let mut guard = lock(&self.state);
        match guard.branches.get(xid).copied() {
            None => Err(BackendError::UnknownBranch(xid.to_string())),
            Some(BranchState::Heuristic) => {
                Err(BackendError::Heuristic(format!("{} was heuristically committed", xid)))
            }
            Some(_) => {
                guard.branches.remove(xid);
                guard.stats.branch_rollbacks += 1;
                Ok(())
            }
        }
    }

    async fn recover(&mut self) -> Result<Vec<Xid>, BackendError> {
        self.check_xa()?;
        let guard = lock(&self.state);
        Ok(guard
            .branches
            .iter()
            .filter(|(_, state)| matches!(state, BranchState::Prepared | BranchState::Heuristic))
            .map(|(xid, _)| xid.clone())
            .collect())
    }

    async fn forget(&mut self, xid: &Xid) -> Result<(), BackendError> {
        self.check_xa()?;
        let mut guard = lock(&self.state);
        match guard.branches.get(xid) {
            Some(BranchState::Heuristic) => {
                guard.branches.remove(xid);
                Ok(())
            }
            _ => Err(BackendError::UnknownBranch(xid.to_string())),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.state).stats.closed += 1;
        }
    }
}
