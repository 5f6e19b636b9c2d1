//! Transaction coordination
//!
//! Sessions run either local transactions or branches of a distributed
//! (two-phase commit) transaction. The coordinator drives both and decides
//! when a session's connection may go back to the pool.

pub mod branch;
pub mod coordinator;

pub use branch::{BranchContext, BranchPhase, EndFlag, StartFlag};
pub use coordinator::{HeldBranchInfo, RecoveryReport, TransactionCoordinator, TxConfig};

use serde::Serialize;
use tokio::time::Instant;

use crate::backend::{BackendError, BackendId, IsolationLevel, Xid};
use crate::pool::PoolError;

/// Transaction error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum TxError {
    #[error("Branch protocol violation on backend {backend}: {detail}")]
    ProtocolViolation {
        backend: BackendId,
        xid: Option<Xid>,
        phase: Option<BranchPhase>,
        detail: String,
    },

    #[error("Resource manager {backend} unavailable: {reason}")]
    RmUnavailable {
        backend: BackendId,
        xid: Option<Xid>,
        phase: Option<BranchPhase>,
        reason: String,
    },

    #[error("Branch {xid} on backend {backend} completed read-only, nothing to commit")]
    ReadOnly { backend: BackendId, xid: Xid },

    #[error("Branch {xid} on backend {backend} is rollback-only (phase {phase})")]
    RollbackOnly {
        backend: BackendId,
        xid: Xid,
        phase: BranchPhase,
    },

    #[error("Heuristic outcome for branch {xid} on backend {backend} in phase {phase}: {detail}")]
    HeuristicOutcome {
        backend: BackendId,
        xid: Xid,
        phase: BranchPhase,
        detail: String,
    },

    #[error("Backend {backend} does not know branch {xid}")]
    UnknownBranch { backend: BackendId, xid: Xid },

    #[error("Backend {backend} failed: {source}")]
    Backend {
        backend: BackendId,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl TxError {
    pub(crate) fn violation(backend: &str, detail: impl Into<String>) -> Self {
        TxError::ProtocolViolation {
            backend: backend.to_string(),
            xid: None,
            phase: None,
            detail: detail.into(),
        }
    }

    /// Map a backend failure during a branch verb
    pub(crate) fn from_branch(err: BackendError, branch: &BranchContext) -> Self {
        let backend = branch.backend.clone();
        let xid = branch.xid.clone();
        let phase = branch.phase();
        match err {
            BackendError::Unavailable(reason) | BackendError::Connect(reason) | BackendError::Invalid(reason) => {
                TxError::RmUnavailable {
                    backend,
                    reason: format!("branch {} in phase {}: {}", xid, phase, reason),
                    xid: Some(xid),
                    phase: Some(phase),
                }
            }
            BackendError::RollbackOnly(_) => TxError::RollbackOnly { backend, xid, phase },
            BackendError::Heuristic(detail) => TxError::HeuristicOutcome { backend, xid, phase, detail },
            BackendError::UnknownBranch(_) => TxError::UnknownBranch { backend, xid },
            other => TxError::Backend { backend, source: other },
        }
    }

    /// Whether the failure means the connection itself is unusable
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(
            self,
            TxError::Backend {
                source: BackendError::Invalid(_) | BackendError::Connect(_),
                ..
            }
        )
    }
}

/// Local transaction state
#[derive(Debug, Clone)]
pub struct LocalTransaction {
    pub isolation: Option<IsolationLevel>,
    pub statements: u64,
    started_at: Instant,
}

impl LocalTransaction {
    pub fn new(isolation: Option<IsolationLevel>) -> Self {
        Self {
            isolation,
            statements: 0,
            started_at: Instant::now(),
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// Transaction a session is currently in
#[derive(Debug, Clone, Default)]
pub enum TransactionContext {
    #[default]
    None,
    Local(LocalTransaction),
    Distributed(BranchContext),
}

impl TransactionContext {
    /// Short description for logs and session listings
    pub fn describe(&self) -> TransactionSummary {
        match self {
            TransactionContext::None => TransactionSummary::None,
            TransactionContext::Local(_) => TransactionSummary::Local,
            TransactionContext::Distributed(branch) => TransactionSummary::Branch {
                xid: branch.xid.to_string(),
                phase: branch.phase(),
            },
        }
    }

    /// A transaction is open and the connection must stay with the session
    pub fn holds_connection(&self) -> bool {
        match self {
            TransactionContext::None => false,
            TransactionContext::Local(_) => true,
            TransactionContext::Distributed(branch) => !branch.phase().is_terminal(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionSummary {
    None,
    Local,
    Branch { xid: String, phase: BranchPhase },
}
