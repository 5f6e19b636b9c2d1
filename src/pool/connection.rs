//! Pooled physical connections and the leases that hand them out
//!
//! A [`PooledConnection`] is owned by its backend pool while idle and by a
//! [`Lease`] while in use. A lease must be given back through the pool's
//! `release`; dropping it instead destroys the connection and frees its
//! capacity, since the connection may be left mid-transaction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::classifier::SlotClass;
use super::subpool::BackendPool;
use super::PoolError;
use crate::backend::{BackendConnection, BackendError, BackendId};

/// Identifier of a physical connection, unique within its backend
pub type ConnectionId = u64;

/// How a connection is given back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Connection is believed usable and may be reused
    Reusable,
    /// Connection failed and must be destroyed
    Broken,
}

/// A physical connection with pool bookkeeping
pub struct PooledConnection {
    id: ConnectionId,
    inner: Box<dyn BackendConnection>,
    native: SlotClass,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl PooledConnection {
    pub(crate) fn new(id: ConnectionId, inner: Box<dyn BackendConnection>, native: SlotClass) -> Self {
        let now = Instant::now();
        Self {
            id,
            inner,
            native,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sub-pool this connection counts against
    pub fn native_class(&self) -> SlotClass {
        self.native
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last handed out or returned
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) async fn validate(&mut self) -> Result<(), BackendError> {
        self.inner.validate().await
    }

    pub(crate) async fn close(mut self) {
        self.inner.close().await;
    }

    pub(crate) fn backend_connection(&mut self) -> &mut dyn BackendConnection {
        self.inner.as_mut()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("native", &self.native)
            .field("use_count", &self.use_count)
            .finish()
    }
}

/// Exclusive use of one pooled connection
pub struct Lease {
    pub(crate) conn: Option<PooledConnection>,
    pub(crate) pool: Arc<BackendPool>,
    pub(crate) class: SlotClass,
    pub(crate) borrowed: bool,
    pub(crate) quarantined: bool,
    pub(crate) leased_at: Instant,
}

impl Lease {
    pub fn backend(&self) -> &BackendId {
        self.pool.id()
    }

    /// Id of the leased connection, if the lease still holds one
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(PooledConnection::id)
    }

    /// Class the connection was requested for
    pub fn class(&self) -> SlotClass {
        self.class
    }

    /// Whether the connection came from the other sub-pool
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    /// Whether the connection is waiting on a deferred release
    pub fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn held_for(&self) -> Duration {
        self.leased_at.elapsed()
    }

    /// Access the backend connection
    pub fn connection(&mut self) -> Result<&mut dyn BackendConnection, PoolError> {
        self.conn
            .as_mut()
            .map(PooledConnection::backend_connection)
            .ok_or_else(|| PoolError::LeaseReleased(self.pool.id().clone()))
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("backend", self.pool.id())
            .field("connection", &self.connection_id())
            .field("class", &self.class)
            .field("borrowed", &self.borrowed)
            .field("quarantined", &self.quarantined)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn, self.quarantined);
        }
    }
}
