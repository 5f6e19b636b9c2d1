//! Transport-neutral request and response types

use serde::Serialize;
use std::time::Duration;

use crate::backend::{BackendId, IsolationLevel, Payload, PrepareVote, Xid};
use crate::cluster::ResizeReport;
use crate::error::{ErrorKind, ProxyError};
use crate::pool::SlotClass;
use crate::session::SessionId;
use crate::txn::{EndFlag, RecoveryReport, StartFlag};

/// Session a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRef {
    New,
    Existing(SessionId),
}

/// Operation carried by a request
#[derive(Debug, Clone)]
pub enum Operation {
    /// Open a session
    Connect { distributed: bool },
    Execute {
        sql: String,
        params: Payload,
        /// Overrides the classifier's choice of sub-pool
        class_hint: Option<SlotClass>,
    },
    Begin { isolation: Option<IsolationLevel> },
    SetAutocommit { autocommit: bool },
    Commit,
    Rollback,
    XaStart { xid: Xid, flag: StartFlag },
    XaEnd { xid: Xid, flag: EndFlag },
    XaPrepare { xid: Xid },
    XaCommit { xid: Xid, one_phase: bool },
    XaRollback { xid: Xid },
    XaForget { xid: Xid },
    XaRecover,
    /// Membership report from a client that sees the whole cluster
    ClusterHealth { report: String },
    Close,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect { .. } => "connect",
            Operation::Execute { .. } => "execute",
            Operation::Begin { .. } => "begin",
            Operation::SetAutocommit { .. } => "set_autocommit",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
            Operation::XaStart { .. } => "xa_start",
            Operation::XaEnd { .. } => "xa_end",
            Operation::XaPrepare { .. } => "xa_prepare",
            Operation::XaCommit { .. } => "xa_commit",
            Operation::XaRollback { .. } => "xa_rollback",
            Operation::XaForget { .. } => "xa_forget",
            Operation::XaRecover => "xa_recover",
            Operation::ClusterHealth { .. } => "cluster_health",
            Operation::Close => "close",
        }
    }
}

/// Inbound request
#[derive(Debug, Clone)]
pub struct Request {
    pub session: SessionRef,
    pub backend: BackendId,
    pub operation: Operation,
    /// Acquisition deadline; the sub-pool default applies when absent
    pub deadline_hint: Option<Duration>,
}

impl Request {
    pub fn new(session: SessionRef, backend: impl Into<BackendId>, operation: Operation) -> Self {
        Self {
            session,
            backend: backend.into(),
            operation,
            deadline_hint: None,
        }
    }

    pub fn connect(backend: impl Into<BackendId>, distributed: bool) -> Self {
        Self::new(SessionRef::New, backend, Operation::Connect { distributed })
    }

    pub fn on(session: SessionId, backend: impl Into<BackendId>, operation: Operation) -> Self {
        Self::new(SessionRef::Existing(session), backend, operation)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_hint = Some(deadline);
        self
    }
}

/// Successful response body
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Connected { session: SessionId },
    Rows(Payload),
    Ack,
    Vote(PrepareVote),
    Recovered(RecoveryReport),
    /// `None` when the report matched the last one seen
    Resized(Option<ResizeReport>),
    Closed,
}

/// Error returned to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ProxyError> for ErrorReply {
    fn from(err: &ProxyError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type Response = Result<ResponseBody, ErrorReply>;
