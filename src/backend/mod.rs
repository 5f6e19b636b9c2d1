//! Database client interface consumed by the pool
//!
//! The core never speaks a wire protocol itself. Everything it needs from a
//! database is expressed through two traits:
//! - [`ConnectionFactory`] opens physical connections for a backend
//! - [`BackendConnection`] runs opaque statements and transaction verbs
//!
//! Statement payloads are passed through untouched as [`Payload`] bytes.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::MemoryBackend;

/// Unique identifier for a backend
pub type BackendId = String;

/// Opaque statement parameters and results
pub type Payload = Bytes;

/// Errors reported by a backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Connection is no longer valid: {0}")]
    Invalid(String),

    #[error("Resource manager unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction marked rollback-only: {0}")]
    RollbackOnly(String),

    #[error("Heuristic outcome: {0}")]
    Heuristic(String),

    #[error("Unknown transaction branch: {0}")]
    UnknownBranch(String),

    #[error("Backend error: {0}")]
    Other(String),
}

/// Transaction isolation levels a session may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Distributed transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    /// Hex form of the global transaction id, shared by all branches
    pub fn global_hex(&self) -> String {
        hex::encode(&self.global_id)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            hex::encode(&self.global_id),
            hex::encode(&self.branch_qualifier)
        )
    }
}

/// Vote returned by a branch prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareVote {
    /// Branch is prepared and awaits commit or rollback
    Ok,
    /// Branch made no changes and is already complete
    ReadOnly,
}

/// A physical connection to a database backend
#[async_trait]
pub trait BackendConnection: Send + 'static {
    /// Check that the connection is still usable
    async fn validate(&mut self) -> Result<(), BackendError>;

    /// Run one statement and return its encoded result
    async fn execute(&mut self, sql: &str, params: &Payload) -> Result<Payload, BackendError>;

    /// Leave autocommit mode and open a local transaction
    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<(), BackendError>;

    async fn commit(&mut self) -> Result<(), BackendError>;

    async fn rollback(&mut self) -> Result<(), BackendError>;

    /// Associate the connection with a branch (new, join or resume)
    async fn xa_start(&mut self, xid: &Xid, resume: bool) -> Result<(), BackendError>;

    /// Dissociate the connection from a branch
    async fn xa_end(&mut self, xid: &Xid, suspend: bool, failed: bool) -> Result<(), BackendError>;

    async fn prepare(&mut self, xid: &Xid) -> Result<PrepareVote, BackendError>;

    async fn commit_branch(&mut self, xid: &Xid, one_phase: bool) -> Result<(), BackendError>;

    async fn rollback_branch(&mut self, xid: &Xid) -> Result<(), BackendError>;

    /// List branches the backend holds in the prepared state
    async fn recover(&mut self) -> Result<Vec<Xid>, BackendError>;

    async fn forget(&mut self, xid: &Xid) -> Result<(), BackendError>;

    /// Close the connection; errors are not reported
    async fn close(&mut self);
}

/// Opens physical connections to backends
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn open(&self, backend: &BackendId) -> Result<Box<dyn BackendConnection>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_display_is_hex() {
        let xid = Xid::new(1, b"gtx".to_vec(), b"b1".to_vec());
        assert_eq!(xid.to_string(), "1:677478:6231");
        assert_eq!(xid.global_hex(), "677478");
    }
}
