//! Transaction coordinator
//!
//! Drives local transactions and distributed branches for sessions, and
//! owns the release policy for their connections:
//! - local sessions give their connection back after every auto-commit
//!   operation and at the end of every transaction
//! - distributed sessions keep their connection until the branch reached a
//!   terminal phase and the client closed the session, whichever happens
//!   last; in between the connection is quarantined
//!
//! Branches whose session closed first are kept in a held table keyed by
//! xid. A later commit, rollback or forget for that xid, from any session,
//! runs on the held connection and then releases it.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::branch::{BranchContext, BranchPhase, EndFlag, StartFlag};
use super::{LocalTransaction, TransactionContext, TxError};
use crate::backend::{BackendConnection, BackendError, BackendId, IsolationLevel, Payload, PrepareVote, Xid};
use crate::pool::{ConnectionPool, Lease, ReleaseOutcome, SlotClass};
use crate::session::{Session, SessionId, SessionKind};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// How long an ended, never prepared branch may stay held after its
    /// session closed before it is rolled back
    pub abandoned_branch_timeout: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            abandoned_branch_timeout: Duration::from_secs(600),
        }
    }
}

/// Branches a backend reported as prepared, reconciled against the
/// branches this coordinator tracks
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub backend: BackendId,

    /// Every branch the backend holds in doubt
    pub in_doubt: Vec<Xid>,

    /// In-doubt branches this coordinator is tracking
    pub recognized: Vec<Xid>,

    /// In-doubt branches this coordinator knows nothing about
    pub unrecognized: Vec<Xid>,

    /// Tracked prepared branches the backend did not report
    pub missing: Vec<Xid>,
}

/// Serializable view of a held branch
#[derive(Debug, Clone, Serialize)]
pub struct HeldBranchInfo {
    pub xid: String,
    pub backend: BackendId,
    pub phase: BranchPhase,
    pub session: SessionId,
    pub held_ms: u64,
}

struct HeldBranch {
    branch: BranchContext,
    lease: Lease,
    session: SessionId,
    held_since: Instant,
    warned: bool,
}

type HeldSlot = Arc<Mutex<Option<HeldBranch>>>;

/// Completed branches remembered so repeated or contradicting verbs get a
/// definite answer after the branch left tracking
const COMPLETED_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct CompletedBranch {
    backend: BackendId,
    phase: BranchPhase,
    read_only: bool,
    at: Instant,
}

#[derive(Debug, Clone)]
struct TrackedBranch {
    backend: BackendId,
    phase: BranchPhase,
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Prepare,
    Commit { one_phase: bool },
    Rollback,
    Forget,
}

impl Verb {
    /// Phase assumed for a branch that is not tracked here
    fn assumed_phase(self) -> BranchPhase {
        match self {
            Verb::Prepare | Verb::Commit { one_phase: true } => BranchPhase::Ended,
            Verb::Commit { one_phase: false } | Verb::Rollback => BranchPhase::Prepared,
            Verb::Forget => BranchPhase::Heuristic,
        }
    }
}

enum VerbOutcome {
    Done,
    Vote(PrepareVote),
}

/// Coordinates local and distributed transactions for sessions
pub struct TransactionCoordinator {
    pool: Arc<ConnectionPool>,
    config: TxConfig,
    tracked: DashMap<Xid, TrackedBranch>,
    held: DashMap<Xid, HeldSlot>,
    completed: DashMap<Xid, CompletedBranch>,
}

impl TransactionCoordinator {
    pub fn new(pool: Arc<ConnectionPool>, config: TxConfig) -> Self {
        Self {
            pool,
            config,
            tracked: DashMap::new(),
            held: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn track(&self, branch: &BranchContext) {
        if branch.phase().is_terminal() {
            self.tracked.remove(&branch.xid);
            self.remember_completed(branch);
        } else {
            self.tracked.insert(
                branch.xid.clone(),
                TrackedBranch {
                    backend: branch.backend.clone(),
                    phase: branch.phase(),
                },
            );
        }
    }

    fn remember_completed(&self, branch: &BranchContext) {
        self.completed.insert(
            branch.xid.clone(),
            CompletedBranch {
                backend: branch.backend.clone(),
                phase: branch.phase(),
                read_only: branch.is_read_only(),
                at: Instant::now(),
            },
        );
        if self.completed.len() <= COMPLETED_CAPACITY {
            return;
        }
        let mut by_age: Vec<(Instant, Xid)> = self
            .completed
            .iter()
            .map(|entry| (entry.at, entry.key().clone()))
            .collect();
        by_age.sort_by_key(|(at, _)| *at);
        for (_, xid) in by_age.into_iter().take(COMPLETED_CAPACITY / 8) {
            self.completed.remove(&xid);
        }
    }

    /// Number of completed branches still remembered
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Backends enlisted in a global transaction through this coordinator
    pub fn enlisted_backends(&self, global_id: &[u8]) -> Vec<BackendId> {
        let backends: BTreeSet<BackendId> = self
            .tracked
            .iter()
            .filter(|entry| entry.key().global_id == global_id)
            .map(|entry| entry.backend.clone())
            .collect();
        backends.into_iter().collect()
    }

    /// Phase of a branch this coordinator is tracking
    pub fn branch_phase(&self, xid: &Xid) -> Option<BranchPhase> {
        self.tracked.get(xid).map(|entry| entry.phase)
    }

    /// Give the session's connection back when the release policy allows
    async fn settle(&self, session: &mut Session) {
        let session_id = session.id();
        match (&session.transaction, session.kind()) {
            (TransactionContext::None, SessionKind::Local) => {
                if let Some(lease) = session.lease.take() {
                    self.pool.release(lease, ReleaseOutcome::Reusable).await;
                }
            }
            (TransactionContext::Distributed(branch), _) if branch.phase().is_terminal() => {
                if let Some(lease) = session.lease.as_mut() {
                    if !lease.is_quarantined() {
                        debug!(
                            session = %session_id,
                            xid = %branch.xid,
                            "Branch complete, connection pending session close"
                        );
                        self.pool.quarantine(lease);
                    }
                }
            }
            _ => {}
        }
    }

    /// Drop the connection after it failed underneath the session
    async fn discard_connection(&self, session: &mut Session) {
        if let Some(lease) = session.lease.take() {
            self.pool.release(lease, ReleaseOutcome::Broken).await;
        }
        let session_id = session.id();
        match &mut session.transaction {
            TransactionContext::Local(_) => {
                warn!(session = %session_id, "Connection lost, local transaction aborted");
                session.transaction = TransactionContext::None;
            }
            TransactionContext::Distributed(branch) if matches!(branch.phase(), BranchPhase::Active | BranchPhase::Suspended) => {
                warn!(session = %session_id, xid = %branch.xid, "Connection lost, branch rolled back by backend");
                branch.force(BranchPhase::RolledBack);
                self.tracked.remove(&branch.xid);
            }
            _ => {}
        }
    }

    /// Run one statement for a session
    pub async fn execute(
        &self,
        session: &mut Session,
        sql: &str,
        params: &Payload,
        class: SlotClass,
        deadline: Option<Duration>,
    ) -> Result<Payload, TxError> {
        if let TransactionContext::Distributed(branch) = &session.transaction {
            let phase = branch.phase();
            if phase != BranchPhase::Active && !phase.is_terminal() {
                return Err(TxError::ProtocolViolation {
                    backend: session.backend().clone(),
                    xid: Some(branch.xid.clone()),
                    phase: Some(phase),
                    detail: format!("statement while branch {} is {}", branch.xid, phase),
                });
            }
        }

        let backend = session.backend().clone();
        let implicit_begin = !session.autocommit() && matches!(session.transaction, TransactionContext::None);
        let lease = session.ensure_lease(&self.pool, class, deadline).await?;
        let conn = lease.connection()?;

        let began = if implicit_begin { conn.begin(None).await } else { Ok(()) };
        let result = match &began {
            Ok(()) => conn.execute(sql, params).await,
            Err(e) => Err(e.clone()),
        };

        if implicit_begin && began.is_ok() {
            session.transaction = TransactionContext::Local(LocalTransaction::new(None));
        }
        if let TransactionContext::Local(tx) = &mut session.transaction {
            tx.statements += 1;
        }

        match result {
            Ok(payload) => {
                self.settle(session).await;
                Ok(payload)
            }
            Err(source) => {
                let err = TxError::Backend { backend, source };
                if err.breaks_connection() {
                    self.discard_connection(session).await;
                } else {
                    self.settle(session).await;
                }
                Err(err)
            }
        }
    }

    /// Explicitly begin a local transaction
    pub async fn begin(
        &self,
        session: &mut Session,
        isolation: Option<IsolationLevel>,
        deadline: Option<Duration>,
    ) -> Result<(), TxError> {
        match &session.transaction {
            TransactionContext::Local(_) => {
                return Err(TxError::violation(session.backend(), "local transaction already active"));
            }
            TransactionContext::Distributed(branch) if !branch.phase().is_terminal() => {
                return Err(TxError::violation(
                    session.backend(),
                    format!("session is associated with branch {}", branch.xid),
                ));
            }
            _ => {}
        }

        let backend = session.backend().clone();
        let lease = session.ensure_lease(&self.pool, SlotClass::Fast, deadline).await?;
        if let Err(source) = lease.connection()?.begin(isolation).await {
            let err = TxError::Backend { backend, source };
            if err.breaks_connection() {
                self.discard_connection(session).await;
            } else {
                self.settle(session).await;
            }
            return Err(err);
        }
        session.transaction = TransactionContext::Local(LocalTransaction::new(isolation));
        debug!(session = %session.id(), ?isolation, "Local transaction started");
        Ok(())
    }

    /// Commit the session's local transaction
    pub async fn commit(&self, session: &mut Session) -> Result<(), TxError> {
        self.finish_local(session, true).await
    }

    /// Roll back the session's local transaction
    pub async fn rollback(&self, session: &mut Session) -> Result<(), TxError> {
        self.finish_local(session, false).await
    }

    async fn finish_local(&self, session: &mut Session, commit: bool) -> Result<(), TxError> {
        match &session.transaction {
            TransactionContext::None => return Ok(()),
            TransactionContext::Distributed(branch) if !branch.phase().is_terminal() => {
                return Err(TxError::ProtocolViolation {
                    backend: session.backend().clone(),
                    xid: Some(branch.xid.clone()),
                    phase: Some(branch.phase()),
                    detail: "local commit or rollback while a branch is open".to_string(),
                });
            }
            TransactionContext::Distributed(_) => return Ok(()),
            TransactionContext::Local(_) => {}
        }

        let backend = session.backend().clone();
        let result = match session.lease.as_mut() {
            Some(lease) => {
                let conn = lease.connection()?;
                if commit {
                    conn.commit().await
                } else {
                    conn.rollback().await
                }
            }
            None => Ok(()),
        };
        session.transaction = TransactionContext::None;

        match result {
            Ok(()) => {
                debug!(session = %session.id(), commit, "Local transaction finished");
                self.settle(session).await;
                Ok(())
            }
            Err(source) => {
                let err = TxError::Backend { backend, source };
                if err.breaks_connection() {
                    self.discard_connection(session).await;
                } else {
                    self.settle(session).await;
                }
                Err(err)
            }
        }
    }

    /// Switch auto-commit; enabling it commits an open local transaction
    pub async fn set_autocommit(&self, session: &mut Session, autocommit: bool) -> Result<(), TxError> {
        if autocommit && matches!(session.transaction, TransactionContext::Local(_)) {
            self.finish_local(session, true).await?;
        }
        session.autocommit = autocommit;
        self.settle(session).await;
        Ok(())
    }

    /// Start, join or resume a branch on the session's connection
    pub async fn xa_start(
        &self,
        session: &mut Session,
        xid: Xid,
        flag: StartFlag,
        deadline: Option<Duration>,
    ) -> Result<(), TxError> {
        if session.kind() != SessionKind::Distributed {
            return Err(TxError::violation(session.backend(), "session does not support distributed transactions"));
        }

        match flag {
            StartFlag::New => {
                match &session.transaction {
                    TransactionContext::Local(_) => {
                        return Err(TxError::violation(session.backend(), "local transaction in progress"));
                    }
                    TransactionContext::Distributed(branch) if !branch.phase().is_terminal() => {
                        return Err(TxError::ProtocolViolation {
                            backend: session.backend().clone(),
                            xid: Some(branch.xid.clone()),
                            phase: Some(branch.phase()),
                            detail: format!("session already associated with branch {}", branch.xid),
                        });
                    }
                    _ => {}
                }
                if self.tracked.contains_key(&xid) {
                    return Err(TxError::violation(session.backend(), format!("duplicate branch {}", xid)));
                }

                self.completed.remove(&xid);
                let branch = BranchContext::new(xid.clone(), session.backend().clone());
                let lease = session.ensure_lease(&self.pool, SlotClass::Fast, deadline).await?;
                if lease.is_quarantined() {
                    self.pool.unquarantine(lease);
                }
                lease
                    .connection()?
                    .xa_start(&xid, false)
                    .await
                    .map_err(|e| TxError::from_branch(e, &branch))?;

                self.track(&branch);
                info!(session = %session.id(), xid = %xid, backend = %branch.backend, "Branch started");
                session.transaction = TransactionContext::Distributed(branch);
                Ok(())
            }
            StartFlag::Join | StartFlag::Resume => {
                let backend = session.backend().clone();
                let (TransactionContext::Distributed(branch), Some(lease)) =
                    (&mut session.transaction, session.lease.as_mut())
                else {
                    return Err(TxError::violation(&backend, format!("no branch {} to re-associate", xid)));
                };
                let expected = if flag == StartFlag::Join {
                    BranchPhase::Ended
                } else {
                    BranchPhase::Suspended
                };
                if branch.xid != xid || branch.phase() != expected {
                    return Err(TxError::ProtocolViolation {
                        backend,
                        xid: Some(branch.xid.clone()),
                        phase: Some(branch.phase()),
                        detail: format!("cannot {:?} branch {}", flag, xid),
                    });
                }
                lease
                    .connection()?
                    .xa_start(&xid, true)
                    .await
                    .map_err(|e| TxError::from_branch(e, branch))?;
                branch.transition(BranchPhase::Active)?;
                self.track(branch);
                Ok(())
            }
        }
    }

    /// End the session's association with a branch
    pub async fn xa_end(&self, session: &mut Session, xid: &Xid, flag: EndFlag) -> Result<(), TxError> {
        let backend = session.backend().clone();
        let (TransactionContext::Distributed(branch), Some(lease)) = (&mut session.transaction, session.lease.as_mut())
        else {
            return Err(TxError::violation(&backend, format!("no branch {} associated", xid)));
        };
        if branch.xid != *xid {
            return Err(TxError::ProtocolViolation {
                backend,
                xid: Some(branch.xid.clone()),
                phase: Some(branch.phase()),
                detail: format!("session is associated with {}, not {}", branch.xid, xid),
            });
        }

        let to = match flag {
            EndFlag::Suspend => BranchPhase::Suspended,
            EndFlag::Success | EndFlag::Fail => BranchPhase::Ended,
        };
        branch.check(to)?;
        lease
            .connection()?
            .xa_end(xid, flag == EndFlag::Suspend, flag == EndFlag::Fail)
            .await
            .map_err(|e| TxError::from_branch(e, branch))?;
        branch.transition(to)?;
        if flag == EndFlag::Fail {
            branch.mark_rollback_only();
        }
        self.track(branch);
        debug!(xid = %xid, phase = %to, "Branch association ended");
        Ok(())
    }

    /// First phase of two-phase commit
    pub async fn xa_prepare(
        &self,
        session: &mut Session,
        xid: &Xid,
        deadline: Option<Duration>,
    ) -> Result<PrepareVote, TxError> {
        match self.run_verb(session, xid, Verb::Prepare, deadline).await? {
            VerbOutcome::Vote(vote) => Ok(vote),
            VerbOutcome::Done => Ok(PrepareVote::Ok),
        }
    }

    /// Commit a branch; attempted once per call and never retried
    pub async fn xa_commit(
        &self,
        session: &mut Session,
        xid: &Xid,
        one_phase: bool,
        deadline: Option<Duration>,
    ) -> Result<(), TxError> {
        self.run_verb(session, xid, Verb::Commit { one_phase }, deadline)
            .await
            .map(|_| ())
    }

    /// Roll back a branch; attempted once per call and never retried
    pub async fn xa_rollback(&self, session: &mut Session, xid: &Xid, deadline: Option<Duration>) -> Result<(), TxError> {
        self.run_verb(session, xid, Verb::Rollback, deadline).await.map(|_| ())
    }

    /// Forget a heuristically completed branch
    pub async fn xa_forget(&self, session: &mut Session, xid: &Xid, deadline: Option<Duration>) -> Result<(), TxError> {
        self.run_verb(session, xid, Verb::Forget, deadline).await.map(|_| ())
    }

    async fn run_verb(
        &self,
        session: &mut Session,
        xid: &Xid,
        verb: Verb,
        deadline: Option<Duration>,
    ) -> Result<VerbOutcome, TxError> {
        let on_session = matches!(&session.transaction, TransactionContext::Distributed(branch) if branch.xid == *xid);
        if on_session {
            let result = match (&mut session.transaction, session.lease.as_mut()) {
                (TransactionContext::Distributed(branch), Some(lease)) => {
                    let result = apply(verb, branch, lease.connection()?).await;
                    self.track(branch);
                    result
                }
                _ => Err(TxError::violation(session.backend(), "branch has no connection")),
            };
            self.settle(session).await;
            return result;
        }

        let slot = self.held.get(xid).map(|entry| entry.value().clone());
        if let Some(slot) = slot {
            return self.run_on_held(slot, xid, verb).await;
        }

        let completed = self.completed.get(xid).map(|entry| entry.value().clone());
        if let Some(done) = completed {
            let branch = BranchContext::completed(xid.clone(), done.backend, done.phase, done.read_only);
            return settled_outcome(verb, &branch).unwrap_or_else(|| {
                Err(TxError::ProtocolViolation {
                    backend: branch.backend.clone(),
                    xid: Some(xid.clone()),
                    phase: Some(branch.phase()),
                    detail: format!("branch {} already completed", xid),
                })
            });
        }

        self.run_untracked(session, xid, verb, deadline).await
    }

    async fn run_on_held(&self, slot: HeldSlot, xid: &Xid, verb: Verb) -> Result<VerbOutcome, TxError> {
        let mut guard = slot.lock().await;
        let Some(held) = guard.as_mut() else {
            return Ok(VerbOutcome::Done);
        };

        let result = match held.lease.connection() {
            Ok(conn) => apply(verb, &mut held.branch, conn).await,
            Err(e) => Err(e.into()),
        };
        self.track(&held.branch);

        if held.branch.phase().is_terminal() {
            if let Some(held) = guard.take() {
                self.held.remove(xid);
                info!(
                    xid = %xid,
                    backend = %held.branch.backend,
                    phase = %held.branch.phase(),
                    held_ms = held.held_since.elapsed().as_millis() as u64,
                    "Held branch completed, releasing connection"
                );
                self.pool.release(held.lease, ReleaseOutcome::Reusable).await;
            }
        }
        result
    }

    /// Complete a branch this coordinator does not track, such as one left
    /// prepared by an earlier coordinator
    async fn run_untracked(
        &self,
        session: &mut Session,
        xid: &Xid,
        verb: Verb,
        deadline: Option<Duration>,
    ) -> Result<VerbOutcome, TxError> {
        if matches!(verb, Verb::Prepare) {
            return Err(TxError::violation(session.backend(), format!("cannot prepare unknown branch {}", xid)));
        }
        let mut branch = BranchContext::recovered(xid.clone(), session.backend().clone(), verb.assumed_phase());
        let lease = session.ensure_lease(&self.pool, SlotClass::Fast, deadline).await?;
        let result = apply(verb, &mut branch, lease.connection()?).await;
        if branch.phase().is_terminal() {
            self.remember_completed(&branch);
        }
        self.settle(session).await;
        result
    }

    /// List in-doubt branches on the session's backend and reconcile them
    pub async fn xa_recover(&self, session: &mut Session, deadline: Option<Duration>) -> Result<RecoveryReport, TxError> {
        let backend = session.backend().clone();
        let lease = session.ensure_lease(&self.pool, SlotClass::Fast, deadline).await?;
        let listed = lease.connection()?.recover().await;
        self.settle(session).await;

        let in_doubt = listed.map_err(|e| match e {
            BackendError::Unavailable(reason) | BackendError::Connect(reason) | BackendError::Invalid(reason) => {
                TxError::RmUnavailable {
                    backend: backend.clone(),
                    xid: None,
                    phase: None,
                    reason: format!("recovery scan: {}", reason),
                }
            }
            other => TxError::Backend {
                backend: backend.clone(),
                source: other,
            },
        })?;

        let tracked: BTreeSet<Xid> = self
            .tracked
            .iter()
            .filter(|entry| entry.backend == backend && matches!(entry.phase, BranchPhase::Prepared | BranchPhase::Heuristic))
            .map(|entry| entry.key().clone())
            .collect();
        let listed: BTreeSet<Xid> = in_doubt.iter().cloned().collect();

        let report = RecoveryReport {
            backend: backend.clone(),
            recognized: listed.intersection(&tracked).cloned().collect(),
            unrecognized: listed.difference(&tracked).cloned().collect(),
            missing: tracked.difference(&listed).cloned().collect(),
            in_doubt,
        };
        if !report.unrecognized.is_empty() {
            warn!(
                backend = %backend,
                count = report.unrecognized.len(),
                "Backend holds in-doubt branches this coordinator does not track"
            );
        }
        Ok(report)
    }

    /// Apply the close half of the release policy to a session
    pub async fn close_session(&self, session: &mut Session) {
        match std::mem::take(&mut session.transaction) {
            TransactionContext::None => {}
            TransactionContext::Local(_) => {
                if let Some(lease) = session.lease.as_mut() {
                    let rolled_back = match lease.connection() {
                        Ok(conn) => conn.rollback().await.is_ok(),
                        Err(_) => false,
                    };
                    if !rolled_back {
                        self.discard_connection(session).await;
                    }
                }
                debug!(session = %session.id(), "Rolled back local transaction on close");
            }
            TransactionContext::Distributed(mut branch) => match branch.phase() {
                phase if phase.is_terminal() => {
                    debug!(session = %session.id(), xid = %branch.xid, "Branch already complete, releasing on close");
                }
                BranchPhase::Active | BranchPhase::Suspended => {
                    let outcome = match session.lease.as_mut().map(Lease::connection) {
                        Some(Ok(conn)) => apply(Verb::Rollback, &mut branch, conn).await,
                        Some(Err(e)) => Err(e.into()),
                        None => Ok(VerbOutcome::Done),
                    };
                    self.track(&branch);
                    if let Err(e) = outcome {
                        warn!(session = %session.id(), xid = %branch.xid, error = %e, "Rollback on close failed");
                        self.tracked.remove(&branch.xid);
                        self.discard_connection(session).await;
                    } else {
                        info!(session = %session.id(), xid = %branch.xid, "Rolled back unfinished branch on close");
                    }
                }
                phase => {
                    if let Some(mut lease) = session.lease.take() {
                        self.pool.quarantine(&mut lease);
                        info!(
                            session = %session.id(),
                            xid = %branch.xid,
                            phase = %phase,
                            "Session closed before branch completed, holding connection"
                        );
                        let xid = branch.xid.clone();
                        self.held.insert(
                            xid,
                            Arc::new(Mutex::new(Some(HeldBranch {
                                branch,
                                lease,
                                session: session.id(),
                                held_since: Instant::now(),
                                warned: false,
                            }))),
                        );
                    }
                    return;
                }
            },
        }

        if let Some(lease) = session.lease.take() {
            self.pool.release(lease, ReleaseOutcome::Reusable).await;
        }
    }

    /// Number of branches held after their session closed
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn held_branches(&self) -> Vec<HeldBranchInfo> {
        let slots: Vec<HeldSlot> = self.held.iter().map(|entry| entry.value().clone()).collect();
        let mut infos: Vec<HeldBranchInfo> = slots
            .iter()
            .filter_map(|slot| {
                let guard = slot.try_lock().ok()?;
                let held = guard.as_ref()?;
                Some(HeldBranchInfo {
                    xid: held.branch.xid.to_string(),
                    backend: held.branch.backend.clone(),
                    phase: held.branch.phase(),
                    session: held.session,
                    held_ms: held.held_since.elapsed().as_millis() as u64,
                })
            })
            .collect();
        infos.sort_by(|a, b| a.xid.cmp(&b.xid));
        infos
    }

    /// Roll back held branches that were ended but never prepared and have
    /// been abandoned; prepared branches are only reported
    pub async fn sweep_held(&self) -> usize {
        let slots: Vec<(Xid, HeldSlot)> = self
            .held
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut rolled_back = 0;
        for (xid, slot) in slots {
            let mut guard = slot.lock().await;
            let Some(held) = guard.as_mut() else {
                continue;
            };
            if held.branch.idle_for() < self.config.abandoned_branch_timeout {
                continue;
            }
            if held.branch.phase() != BranchPhase::Ended {
                if !held.warned {
                    held.warned = true;
                    warn!(
                        xid = %xid,
                        backend = %held.branch.backend,
                        phase = %held.branch.phase(),
                        "In-doubt branch still waiting for its transaction manager"
                    );
                }
                continue;
            }

            let outcome = match held.lease.connection() {
                Ok(conn) => apply(Verb::Rollback, &mut held.branch, conn).await,
                Err(e) => Err(e.into()),
            };
            self.track(&held.branch);
            if let Some(held) = guard.take() {
                self.held.remove(&xid);
                let release = match outcome {
                    Ok(_) => {
                        info!(xid = %xid, "Rolled back abandoned branch");
                        ReleaseOutcome::Reusable
                    }
                    Err(e) => {
                        warn!(xid = %xid, error = %e, "Failed to roll back abandoned branch");
                        self.tracked.remove(&xid);
                        ReleaseOutcome::Broken
                    }
                };
                self.pool.release(held.lease, release).await;
                rolled_back += 1;
            }
        }
        rolled_back
    }

    /// Close held connections; prepared branches stay recoverable on the backend
    pub async fn shutdown(&self) {
        let slots: Vec<(Xid, HeldSlot)> = self
            .held
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (xid, slot) in slots {
            if let Some(held) = slot.lock().await.take() {
                warn!(
                    xid = %xid,
                    backend = %held.branch.backend,
                    phase = %held.branch.phase(),
                    "Shutting down with branch still held"
                );
                self.pool.release(held.lease, ReleaseOutcome::Broken).await;
            }
            self.held.remove(&xid);
        }
    }
}

/// Run one branch verb on a connection, updating the branch phase
async fn apply(verb: Verb, branch: &mut BranchContext, conn: &mut dyn BackendConnection) -> Result<VerbOutcome, TxError> {
    let xid = branch.xid.clone();
    match verb {
        Verb::Prepare => {
            if branch.is_rollback_only() {
                return Err(rollback_only(branch));
            }
            branch.check(BranchPhase::Prepared)?;
            match conn.prepare(&xid).await {
                Ok(PrepareVote::Ok) => {
                    branch.transition(BranchPhase::Prepared)?;
                    debug!(xid = %xid, "Branch prepared");
                    Ok(VerbOutcome::Vote(PrepareVote::Ok))
                }
                Ok(PrepareVote::ReadOnly) => {
                    branch.complete_read_only();
                    debug!(xid = %xid, "Branch prepared read-only and completed");
                    Ok(VerbOutcome::Vote(PrepareVote::ReadOnly))
                }
                Err(BackendError::RollbackOnly(_)) => {
                    branch.force(BranchPhase::RolledBack);
                    Err(rollback_only(branch))
                }
                Err(e) => Err(TxError::from_branch(e, branch)),
            }
        }
        Verb::Commit { one_phase } => {
            if let Some(outcome) = settled_outcome(verb, branch) {
                return outcome;
            }
            if branch.is_rollback_only() {
                return Err(rollback_only(branch));
            }
            let required = if one_phase { BranchPhase::Ended } else { BranchPhase::Prepared };
            if branch.phase() != required {
                return Err(TxError::ProtocolViolation {
                    backend: branch.backend.clone(),
                    xid: Some(xid),
                    phase: Some(branch.phase()),
                    detail: format!(
                        "{} commit requires a {} branch",
                        if one_phase { "one-phase" } else { "two-phase" },
                        required
                    ),
                });
            }

            match conn.commit_branch(&xid, one_phase).await {
                Ok(()) => {
                    branch.transition(BranchPhase::Committed)?;
                    info!(xid = %xid, backend = %branch.backend, one_phase, "Branch committed");
                    Ok(VerbOutcome::Done)
                }
                Err(BackendError::RollbackOnly(_)) => {
                    branch.force(BranchPhase::RolledBack);
                    Err(rollback_only(branch))
                }
                Err(e @ BackendError::Heuristic(_)) => {
                    let err = TxError::from_branch(e, branch);
                    branch.force(BranchPhase::Heuristic);
                    Err(err)
                }
                Err(e) => Err(TxError::from_branch(e, branch)),
            }
        }
        Verb::Rollback => {
            if let Some(outcome) = settled_outcome(verb, branch) {
                return outcome;
            }
            if matches!(branch.phase(), BranchPhase::Active | BranchPhase::Suspended) {
                conn.xa_end(&xid, false, true)
                    .await
                    .map_err(|e| TxError::from_branch(e, branch))?;
            }
            match conn.rollback_branch(&xid).await {
                Ok(()) => {
                    branch.force(BranchPhase::RolledBack);
                    info!(xid = %xid, backend = %branch.backend, "Branch rolled back");
                    Ok(VerbOutcome::Done)
                }
                Err(e @ BackendError::UnknownBranch(_)) if branch.is_recovered() => Err(TxError::from_branch(e, branch)),
                Err(BackendError::UnknownBranch(_)) => {
                    warn!(xid = %xid, backend = %branch.backend, "Backend has no record of branch, treating as rolled back");
                    branch.force(BranchPhase::RolledBack);
                    Ok(VerbOutcome::Done)
                }
                Err(e @ BackendError::Heuristic(_)) => {
                    let err = TxError::from_branch(e, branch);
                    branch.force(BranchPhase::Heuristic);
                    Err(err)
                }
                Err(e) => Err(TxError::from_branch(e, branch)),
            }
        }
        Verb::Forget => {
            branch.check(BranchPhase::Forgotten)?;
            conn.forget(&xid).await.map_err(|e| TxError::from_branch(e, branch))?;
            branch.transition(BranchPhase::Forgotten)?;
            info!(xid = %xid, backend = %branch.backend, "Heuristic branch forgotten");
            Ok(VerbOutcome::Done)
        }
    }
}

/// Answer a commit or rollback for a branch that already completed,
/// without touching the backend
fn settled_outcome(verb: Verb, branch: &BranchContext) -> Option<Result<VerbOutcome, TxError>> {
    let phase = branch.phase();
    let conflict = |detail: String| {
        Some(Err(TxError::ProtocolViolation {
            backend: branch.backend.clone(),
            xid: Some(branch.xid.clone()),
            phase: Some(phase),
            detail,
        }))
    };
    match (verb, phase) {
        (Verb::Commit { .. }, BranchPhase::Committed) if branch.is_read_only() => Some(Err(TxError::ReadOnly {
            backend: branch.backend.clone(),
            xid: branch.xid.clone(),
        })),
        (Verb::Commit { .. }, BranchPhase::Committed) => Some(Ok(VerbOutcome::Done)),
        (Verb::Commit { .. }, BranchPhase::RolledBack | BranchPhase::Forgotten) => {
            conflict("commit requested for a branch that already completed".to_string())
        }
        (Verb::Rollback, BranchPhase::RolledBack) => Some(Ok(VerbOutcome::Done)),
        (Verb::Rollback, BranchPhase::Committed | BranchPhase::Forgotten | BranchPhase::Heuristic) => {
            conflict(format!("rollback requested for a {} branch", phase))
        }
        _ => None,
    }
}

fn rollback_only(branch: &BranchContext) -> TxError {
    TxError::RollbackOnly {
        backend: branch.backend.clone(),
        xid: branch.xid.clone(),
        phase: branch.phase(),
    }
}
