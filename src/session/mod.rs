//! Client sessions
//!
//! A session is one client-visible logical connection. It leases a physical
//! connection lazily on its first operation and keeps it for as long as a
//! transaction is open.

pub mod registry;

pub use registry::{SessionConfig, SessionHandle, SessionRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::BackendId;
use crate::pool::{ConnectionPool, Lease, PoolError, SlotClass};
use crate::txn::{TransactionContext, TransactionSummary};

/// Session error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Backend not found: {0}")]
    UnknownBackend(BackendId),

    #[error("Session registry is shutting down")]
    ShuttingDown,
}

/// Opaque session identifier handed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| SessionError::UnknownSession(s.to_string()))
    }
}

/// Whether a session may take part in distributed transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Local,
    Distributed,
}

/// One logical client connection
pub struct Session {
    id: SessionId,
    backend: BackendId,
    kind: SessionKind,
    pub(crate) lease: Option<Lease>,
    pub(crate) transaction: TransactionContext,
    pub(crate) autocommit: bool,
    opened_at: DateTime<Utc>,
    last_activity: Instant,
    operations: u64,
}

impl Session {
    pub(crate) fn new(backend: BackendId, kind: SessionKind) -> Self {
        Self {
            id: SessionId::new(),
            backend,
            kind,
            lease: None,
            transaction: TransactionContext::None,
            autocommit: true,
            opened_at: Utc::now(),
            last_activity: Instant::now(),
            operations: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn transaction(&self) -> &TransactionContext {
        &self.transaction
    }

    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Record client activity
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.operations += 1;
    }

    /// Lease a connection if the session does not hold one yet
    pub(crate) async fn ensure_lease(
        &mut self,
        pool: &ConnectionPool,
        class: SlotClass,
        deadline: Option<Duration>,
    ) -> Result<&mut Lease, PoolError> {
        if self.lease.is_none() {
            let lease = pool.acquire(&self.backend, class, deadline).await?;
            self.lease = Some(lease);
        }
        self.lease
            .as_mut()
            .ok_or_else(|| PoolError::LeaseReleased(self.backend.clone()))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            backend: self.backend.clone(),
            kind: self.kind,
            autocommit: self.autocommit,
            transaction: self.transaction.describe(),
            leased: self.lease.is_some(),
            quarantined: self.lease.as_ref().is_some_and(Lease::is_quarantined),
            opened_at: self.opened_at,
            idle_ms: self.idle_for().as_millis() as u64,
            operations: self.operations,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("kind", &self.kind)
            .field("transaction", &self.transaction.describe())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub backend: BackendId,
    pub kind: SessionKind,
    pub autocommit: bool,
    pub transaction: TransactionSummary,
    pub leased: bool,
    pub quarantined: bool,
    pub opened_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub operations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_round_trips_through_text() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(matches!("not-a-session".parse::<SessionId>(), Err(SessionError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_new_session_defaults() {
        let session = Session::new("db1".to_string(), SessionKind::Local);
        assert!(session.autocommit());
        assert!(!session.is_leased());
        assert_eq!(session.info().transaction, TransactionSummary::None);
    }
}
