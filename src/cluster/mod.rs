//! Cluster pool sizing
//!
//! Splits each backend's total capacity across the active proxy nodes and
//! pushes the local share to the pool.

pub mod coordinator;
pub mod membership;
pub mod sizing;

pub use coordinator::{ClusterSizingCoordinator, ResizeReport};
pub use membership::{Membership, NodeStatus};
pub use sizing::{compute_targets, local_target};

/// Cluster error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("Malformed cluster health entry: {0}")]
    MalformedEntry(String),
}
