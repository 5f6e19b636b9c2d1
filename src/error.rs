//! Client-facing error taxonomy
//!
//! Every module keeps its own error enum; `ProxyError` gathers them at the
//! request boundary and `ErrorKind` is what a client sees.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::backend::BackendError;
use crate::cluster::ClusterError;
use crate::pool::{CircuitError, PoolError};
use crate::session::SessionError;
use crate::txn::TxError;

/// Error kinds reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AcquisitionTimeout,
    CircuitOpen,
    UnknownSession,
    ValidationFailure,
    BranchProtocolViolation,
    RmUnavailable,
    ReadOnly,
    RollbackOnly,
    HeuristicOutcome,
    UnknownBranch,
    BackendFailure,
    InvalidRequest,
    ShuttingDown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AcquisitionTimeout => "ACQUISITION_TIMEOUT",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::UnknownSession => "UNKNOWN_SESSION",
            ErrorKind::ValidationFailure => "VALIDATION_FAILURE",
            ErrorKind::BranchProtocolViolation => "BRANCH_PROTOCOL_VIOLATION",
            ErrorKind::RmUnavailable => "RM_UNAVAILABLE",
            ErrorKind::ReadOnly => "READ_ONLY",
            ErrorKind::RollbackOnly => "ROLLBACK_ONLY",
            ErrorKind::HeuristicOutcome => "HEURISTIC_OUTCOME",
            ErrorKind::UnknownBranch => "UNKNOWN_BRANCH",
            ErrorKind::BackendFailure => "BACKEND_FAILURE",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::AcquisitionTimeout | ErrorKind::CircuitOpen | ErrorKind::RmUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by request handling
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transaction(#[from] TxError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<CircuitError> for ProxyError {
    fn from(err: CircuitError) -> Self {
        ProxyError::Pool(err.into())
    }
}

impl ProxyError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        ProxyError::InvalidRequest(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Pool(err) => match err {
                PoolError::AcquisitionTimeout { .. } => ErrorKind::AcquisitionTimeout,
                PoolError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
                PoolError::ValidationFailure { .. } => ErrorKind::ValidationFailure,
                PoolError::ConnectionFailed { .. } | PoolError::LeaseReleased(_) | PoolError::Abandoned(_) => {
                    ErrorKind::BackendFailure
                }
                PoolError::BackendNotFound(_) => ErrorKind::InvalidRequest,
                PoolError::ShuttingDown => ErrorKind::ShuttingDown,
            },
            ProxyError::Session(err) => match err {
                SessionError::UnknownSession(_) => ErrorKind::UnknownSession,
                SessionError::UnknownBackend(_) => ErrorKind::InvalidRequest,
                SessionError::ShuttingDown => ErrorKind::ShuttingDown,
            },
            ProxyError::Transaction(err) => match err {
                TxError::ProtocolViolation { .. } => ErrorKind::BranchProtocolViolation,
                TxError::RmUnavailable { .. } => ErrorKind::RmUnavailable,
                TxError::ReadOnly { .. } => ErrorKind::ReadOnly,
                TxError::RollbackOnly { .. } => ErrorKind::RollbackOnly,
                TxError::HeuristicOutcome { .. } => ErrorKind::HeuristicOutcome,
                TxError::UnknownBranch { .. } => ErrorKind::UnknownBranch,
                TxError::Backend { .. } => ErrorKind::BackendFailure,
                TxError::Pool(pool) => ProxyError::Pool(pool.clone()).kind(),
            },
            ProxyError::Cluster(_) | ProxyError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProxyError::Backend(_) => ErrorKind::BackendFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Xid;
    use crate::pool::SlotClass;
    use crate::txn::BranchPhase;
    use std::time::Duration;

    #[test]
    fn test_pool_errors_map_to_kinds() {
        let timeout = ProxyError::from(PoolError::AcquisitionTimeout {
            backend: "db1".to_string(),
            class: SlotClass::Slow,
            waited: Duration::from_millis(5),
        });
        assert_eq!(timeout.kind(), ErrorKind::AcquisitionTimeout);
        assert!(timeout.kind().is_transient());

        let wrapped = ProxyError::from(TxError::Pool(PoolError::CircuitOpen {
            backend: "db1".to_string(),
            retry_in: Duration::from_secs(1),
        }));
        assert_eq!(wrapped.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_transaction_errors_keep_branch_detail() {
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());
        let err = ProxyError::from(TxError::RollbackOnly {
            backend: "db1".to_string(),
            xid: xid.clone(),
            phase: BranchPhase::Ended,
        });
        assert_eq!(err.kind(), ErrorKind::RollbackOnly);
        let message = err.to_string();
        assert!(message.contains("db1"));
        assert!(message.contains(&xid.to_string()));
        assert!(message.contains("ended"));
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::BranchProtocolViolation.to_string(), "BRANCH_PROTOCOL_VIOLATION");
        assert_eq!(
            serde_yaml::to_string(&ErrorKind::RmUnavailable).unwrap().trim(),
            "RM_UNAVAILABLE"
        );
    }
}
