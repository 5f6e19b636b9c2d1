use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::ConnectionFactory;
use crate::cluster::ClusterSizingCoordinator;
use crate::config::Config;
use crate::pool::{ConnectionPool, PoolStats};
use crate::proxy::{Request, Response};
use crate::session::{SessionInfo, SessionRegistry};
use crate::txn::{HeldBranchInfo, TransactionCoordinator};

/// Point-in-time view of the whole core
#[derive(Debug, Clone, Serialize)]
pub struct CoreSnapshot {
    pub local_node: String,
    pub active_nodes: usize,
    pub pools: Vec<PoolStats>,
    pub session_count: usize,
    pub sessions: Vec<SessionInfo>,
    pub held_branch_count: usize,
    pub held_branches: Vec<HeldBranchInfo>,
}

/// Core shared by the CLI and any front end
///
/// Clones share the same pools, sessions and background tasks.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub sessions: Arc<SessionRegistry>,
    pub cluster: Arc<ClusterSizingCoordinator>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Core {
    pub async fn new(config: Config, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let config = Arc::new(config);

        let pool = Arc::new(ConnectionPool::new(config.pool_config(), factory));
        for backend in &config.backends {
            pool.register_backend(backend.id.clone(), Some(config.backend_capacity(backend)));
        }

        let coordinator = Arc::new(TransactionCoordinator::new(pool.clone(), config.tx_config()));
        let sessions = Arc::new(SessionRegistry::new(
            pool.clone(),
            coordinator.clone(),
            config.session_config(),
        ));
        let cluster = Arc::new(ClusterSizingCoordinator::new(
            config.cluster.local_node.clone(),
            pool.clone(),
            config.cluster.total_capacity,
        ));

        // A node starts out alone until the first health report arrives
        cluster.apply_node_count(1).await;

        let (shutdown, _) = watch::channel(false);
        info!(
            backends = config.backends.len(),
            local_node = %config.cluster.local_node,
            "Core initialized"
        );

        Ok(Self {
            config,
            pool,
            coordinator,
            sessions,
            cluster,
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Start pool housekeeping and the session reaper (long-running mode)
    pub fn start_background_tasks(&self) {
        let housekeeping = self.pool.start_housekeeping(self.shutdown.subscribe());
        let reaper = self.sessions.start_reaper(self.shutdown.subscribe());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([housekeeping, reaper]);
    }

    /// Serve one request
    pub async fn handle(&self, request: Request) -> Response {
        crate::proxy::handle(self, request).await
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        let held_branches = self.coordinator.held_branches();
        CoreSnapshot {
            local_node: self.cluster.local_node().to_string(),
            active_nodes: self.cluster.membership().map_or(1, |m| m.len()),
            pools: self.pool.get_all_stats(),
            session_count: self.sessions.len(),
            sessions: self.sessions.list(),
            held_branch_count: self.coordinator.held_count(),
            held_branches,
        }
    }

    /// Close every session, release held branches and stop background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down core");
        let _ = self.shutdown.send(true);

        self.sessions.drain().await;
        self.coordinator.shutdown().await;
        self.pool.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}
