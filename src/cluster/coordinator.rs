//! Pushes this node's share of each backend's capacity to the pool

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::membership::Membership;
use super::sizing::local_target;
use super::ClusterError;
use crate::backend::BackendId;
use crate::pool::ConnectionPool;

/// Target applied to one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendTarget {
    pub backend: BackendId,
    pub total: usize,
    pub previous: usize,
    pub target: usize,
}

/// Outcome of one resize
#[derive(Debug, Clone, Serialize)]
pub struct ResizeReport {
    pub active_nodes: usize,
    pub local_index: usize,
    pub targets: Vec<BackendTarget>,
}

#[derive(Default)]
struct LastSeen {
    report: Option<String>,
    membership: Option<Membership>,
}

/// Recomputes local pool targets when cluster membership changes
pub struct ClusterSizingCoordinator {
    local_node: String,
    pool: Arc<ConnectionPool>,
    /// Cluster-wide capacity per backend; defaults to each backend's
    /// configured maximum
    total_capacity: Option<usize>,
    last: Mutex<LastSeen>,
    /// Held from comparing a report until its targets are applied
    resizing: AsyncMutex<()>,
}

impl ClusterSizingCoordinator {
    pub fn new(local_node: impl Into<String>, pool: Arc<ConnectionPool>, total_capacity: Option<usize>) -> Self {
        Self {
            local_node: local_node.into(),
            pool,
            total_capacity,
            last: Mutex::new(LastSeen::default()),
            resizing: AsyncMutex::new(()),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Membership the current targets were computed from
    pub fn membership(&self) -> Option<Membership> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).membership.clone()
    }

    /// Apply a membership; backends may shrink by attrition only
    pub async fn apply_membership(&self, membership: Membership) -> ResizeReport {
        let _resizing = self.resizing.lock().await;
        self.apply_membership_locked(membership).await
    }

    async fn apply_membership_locked(&self, membership: Membership) -> ResizeReport {
        let local_index = membership.index_of(&self.local_node).unwrap_or(0);
        let report = self.resize(membership.len(), local_index).await;
        info!(membership = %membership, "Cluster membership applied");
        self.last.lock().unwrap_or_else(PoisonError::into_inner).membership = Some(membership);
        report
    }

    async fn resize(&self, nodes: usize, local_index: usize) -> ResizeReport {
        let active_nodes = nodes.max(1);
        let mut targets = Vec::new();
        for backend in self.pool.backend_ids() {
            let Ok(pool) = self.pool.backend(&backend) else {
                continue;
            };
            let total = self.total_capacity.unwrap_or_else(|| pool.configured_capacity());
            let target = local_target(total, active_nodes, local_index);
            if target == 0 {
                warn!(backend = %backend, total, nodes = active_nodes, "No capacity left for this node");
            }
            let previous = pool.target();
            if let Err(e) = self.pool.set_target(&backend, target).await {
                warn!(backend = %backend, error = %e, "Failed to apply pool target");
                continue;
            }
            targets.push(BackendTarget {
                backend,
                total,
                previous,
                target,
            });
        }

        info!(nodes = active_nodes, index = local_index, backends = targets.len(), "Applied cluster pool sizing");
        ResizeReport {
            active_nodes,
            local_index,
            targets,
        }
    }

    /// Apply a cluster-health report if it differs from the last one seen;
    /// the first report always applies
    pub async fn apply_health_report(&self, report: &str) -> Result<Option<ResizeReport>, ClusterError> {
        let report = report.trim();
        let membership = Membership::from_report(report, &self.local_node)?;
        let _resizing = self.resizing.lock().await;
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if last.report.as_deref() == Some(report) {
                debug!(report = %report, "Cluster health unchanged");
                return Ok(None);
            }
            match &last.report {
                Some(previous) => info!(from = %previous, to = %report, "Cluster health changed"),
                None => info!(report = %report, "First cluster health report"),
            }
            last.report = Some(report.to_string());
        }
        Ok(Some(self.apply_membership_locked(membership).await))
    }

    /// Size the pool for a fixed node count, taking the first share
    pub async fn apply_node_count(&self, nodes: usize) -> ResizeReport {
        let _resizing = self.resizing.lock().await;
        self.resize(nodes, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::pool::PoolConfig;

    fn coordinator(total: Option<usize>) -> ClusterSizingCoordinator {
        let pool = Arc::new(ConnectionPool::new(
            PoolConfig {
                max_connections: 30,
                ..PoolConfig::default()
            },
            Arc::new(MemoryBackend::new()),
        ));
        pool.register_backend("db1".to_string(), None);
        pool.register_backend("db2".to_string(), Some(10));
        ClusterSizingCoordinator::new("node-a:1059", pool, total)
    }

    fn target(report: &ResizeReport, backend: &str) -> usize {
        report
            .targets
            .iter()
            .find(|t| t.backend == backend)
            .map(|t| t.target)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_first_report_always_applies() {
        let coordinator = coordinator(None);
        let report = coordinator.apply_health_report("node-a:1059(UP)").await.unwrap().unwrap();
        assert_eq!(report.active_nodes, 1);
        assert_eq!(target(&report, "db1"), 30);
        assert_eq!(target(&report, "db2"), 10);

        assert!(coordinator.apply_health_report("node-a:1059(UP)").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_split_with_remainder_by_sorted_index() {
        let coordinator = coordinator(None);
        let report = coordinator
            .apply_health_report("node-c:1059(UP);node-a:1059(UP);node-b:1059(UP)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.local_index, 0);
        assert_eq!(target(&report, "db1"), 10);
        assert_eq!(target(&report, "db2"), 4);
    }

    #[tokio::test]
    async fn test_down_nodes_do_not_count() {
        let coordinator = coordinator(Some(12));
        let report = coordinator
            .apply_health_report("node-a:1059(UP);node-b:1059(DOWN);node-c:1059(UP)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.active_nodes, 2);
        assert_eq!(target(&report, "db1"), 6);
        assert_eq!(target(&report, "db2"), 6);
    }

    #[tokio::test]
    async fn test_malformed_report_rejected() {
        let coordinator = coordinator(None);
        assert!(coordinator.apply_health_report("node-a:1059(UP);???").await.is_err());
        assert!(coordinator.membership().is_none());
    }

    #[tokio::test]
    async fn test_node_beyond_capacity_gets_nothing() {
        let coordinator = coordinator(Some(2));
        let report = coordinator
            .apply_health_report("node-x:1059(UP);node-y:1059(UP);node-a:1059(UP)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.active_nodes, 3);
        assert_eq!(report.local_index, 0);
        assert_eq!(target(&report, "db1"), 1);

        let coordinator = ClusterSizingCoordinator::new("node-z:1059", coordinator.pool.clone(), Some(2));
        let report = coordinator
            .apply_health_report("node-x:1059(UP);node-y:1059(UP);node-z:1059(UP)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.local_index, 2);
        assert_eq!(target(&report, "db1"), 0);
        assert_eq!(coordinator.pool.get_stats("db1").unwrap().target, 0);
    }

    #[tokio::test]
    async fn test_concurrent_reports_leave_the_last_applied() {
        let coordinator = Arc::new(coordinator(Some(30)));
        let reports = ["node-a:1059(UP);node-b:1059(UP)", "node-a:1059(UP);node-b:1059(UP);node-c:1059(UP)"];
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let coordinator = coordinator.clone();
                let report = reports[i % 2];
                tokio::spawn(async move { coordinator.apply_health_report(report).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let membership = coordinator.membership().unwrap();
        let expected = if membership.len() == 2 { 15 } else { 10 };
        assert_eq!(coordinator.pool.get_stats("db1").unwrap().target, expected);
    }

    #[tokio::test]
    async fn test_apply_node_count() {
        let coordinator = coordinator(None);
        let report = coordinator.apply_node_count(4).await;
        assert_eq!(report.active_nodes, 4);
        assert_eq!(target(&report, "db1"), 8);
        assert_eq!(target(&report, "db2"), 3);
    }
}
