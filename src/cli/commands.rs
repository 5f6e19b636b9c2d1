//! Operator commands: configuration check, sizing plan and simulation

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{MemoryBackend, PrepareVote, Xid};
use crate::cluster::{compute_targets, Membership};
use crate::config::Config;
use crate::core::Core;
use crate::error::ErrorKind;
use crate::pool::{ConnectionPool, SlotClass};
use crate::proxy::{Operation, Request, ResponseBody};
use crate::session::SessionId;
use crate::txn::{EndFlag, StartFlag};

/// Validate a configuration and print how each backend will be split
pub fn cmd_check(config: &Config) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    let pool = ConnectionPool::new(config.pool_config(), Arc::new(MemoryBackend::new()));
    println!("Configuration OK");
    println!("Local node: {}", config.cluster.local_node);
    println!(
        "Timeouts: fast {}ms, slow {}ms; circuit opens after {} failures for {}ms",
        config.pool.fast_timeout_ms,
        config.pool.slow_timeout_ms,
        config.circuit.failure_threshold,
        config.circuit.cooldown_ms
    );
    println!();
    println!("{:<20} {:>8} {:>6} {:>6}  URL", "BACKEND", "CAPACITY", "FAST", "SLOW");
    for backend in &config.backends {
        let capacity = config.backend_capacity(backend);
        pool.register_backend(backend.id.clone(), Some(capacity));
        let (fast, slow) = pool.backend(&backend.id)?.capacities();
        println!("{:<20} {:>8} {:>6} {:>6}  {}", backend.id, capacity, fast, slow, backend.url);
    }
    Ok(())
}

/// Print per-node targets for a node count or a cluster-health report
pub fn cmd_plan(config: &Config, nodes: Option<usize>, report: Option<&str>) -> Result<()> {
    let (members, local_index) = match (report, nodes) {
        (Some(report), _) => {
            let membership = Membership::from_report(report, &config.cluster.local_node)?;
            let index = membership.index_of(&config.cluster.local_node).unwrap_or(0);
            (membership.nodes().to_vec(), Some(index))
        }
        (None, Some(n)) if n > 0 => ((1..=n).map(|i| format!("node-{}", i)).collect(), None),
        (None, _) => anyhow::bail!("Either --nodes (at least 1) or --report is required"),
    };

    println!("Active nodes: {}", members.len());
    for backend in &config.backends {
        let total = config
            .cluster
            .total_capacity
            .unwrap_or_else(|| config.backend_capacity(backend));
        println!();
        println!("{} (total {})", backend.id, total);
        for (i, (node, target)) in members.iter().zip(compute_targets(total, members.len())).enumerate() {
            let marker = if Some(i) == local_index { " (local)" } else { "" };
            println!("  [{}] {:<28} {:>5}{}", i, node, target.max(1), marker);
        }
    }
    Ok(())
}

/// Tally of simulated request outcomes
#[derive(Debug, Default)]
struct Outcomes {
    ok: u64,
    errors: BTreeMap<ErrorKind, u64>,
}

impl Outcomes {
    fn record<T>(&mut self, result: &Result<T, crate::proxy::ErrorReply>) {
        match result {
            Ok(_) => self.ok += 1,
            Err(e) => *self.errors.entry(e.kind).or_default() += 1,
        }
    }

    fn merge(&mut self, other: Outcomes) {
        self.ok += other.ok;
        for (kind, count) in other.errors {
            *self.errors.entry(kind).or_default() += count;
        }
    }
}

/// Run concurrent clients against in-memory backends and print the final
/// snapshot as YAML
pub async fn cmd_simulate(config: Config, clients: usize, operations: usize, latency_ms: u64) -> Result<()> {
    let backends = MemoryBackend::new();
    for backend in &config.backends {
        backends.set_latency(&backend.id, Duration::from_millis(latency_ms));
    }
    let ids: Vec<String> = config.backends.iter().map(|b| b.id.clone()).collect();

    let core = Core::new(config, Arc::new(backends)).await?;
    core.start_background_tasks();
    info!(clients, operations, "Starting simulation");

    let handles: Vec<_> = (0..clients)
        .map(|client| {
            let core = core.clone();
            let ids = ids.clone();
            tokio::spawn(async move { run_client(core, client, ids, operations).await })
        })
        .collect();

    let mut outcomes = Outcomes::default();
    for result in futures::future::join_all(handles).await {
        outcomes.merge(result.context("Simulated client panicked")?);
    }

    let snapshot = core.snapshot();
    core.shutdown().await;

    println!("# {} requests succeeded", outcomes.ok);
    for (kind, count) in &outcomes.errors {
        println!("# {} requests failed with {}", count, kind);
    }
    print!("{}", serde_yaml::to_string(&snapshot).context("Failed to render snapshot")?);
    Ok(())
}

async fn run_client(core: Core, client: usize, backends: Vec<String>, operations: usize) -> Outcomes {
    let mut rng = StdRng::from_entropy();
    let mut outcomes = Outcomes::default();

    for op in 0..operations {
        let backend = backends[rng.gen_range(0..backends.len())].clone();
        let distributed = rng.gen_bool(0.3);
        let connected = core.handle(Request::connect(backend.clone(), distributed)).await;
        outcomes.record(&connected);
        let Ok(ResponseBody::Connected { session }) = connected else {
            continue;
        };

        if distributed {
            let xid = Xid::new(1, format!("sim-{}-{}", client, op).into_bytes(), backend.clone().into_bytes());
            run_branch(&core, session, &backend, xid, &mut rng, &mut outcomes).await;
        } else {
            let statements = rng.gen_range(1..=3);
            let transactional = rng.gen_bool(0.5);
            if transactional {
                let begun = core.handle(Request::on(session, backend.clone(), Operation::Begin { isolation: None })).await;
                outcomes.record(&begun);
            }
            for _ in 0..statements {
                let executed = core.handle(execute(session, &backend, &mut rng)).await;
                outcomes.record(&executed);
            }
            if transactional {
                let finish = if rng.gen_bool(0.8) { Operation::Commit } else { Operation::Rollback };
                outcomes.record(&core.handle(Request::on(session, backend.clone(), finish)).await);
            }
        }

        outcomes.record(&core.handle(Request::on(session, backend.clone(), Operation::Close)).await);
    }
    debug!(client, ok = outcomes.ok, "Simulated client finished");
    outcomes
}

async fn run_branch(
    core: &Core,
    session: SessionId,
    backend: &str,
    xid: Xid,
    rng: &mut StdRng,
    outcomes: &mut Outcomes,
) {
    let on = |operation| Request::on(session, backend.to_string(), operation);

    let started = core
        .handle(on(Operation::XaStart {
            xid: xid.clone(),
            flag: StartFlag::New,
        }))
        .await;
    outcomes.record(&started);
    if started.is_err() {
        return;
    }
    outcomes.record(&core.handle(execute(session, backend, rng)).await);
    outcomes.record(
        &core
            .handle(on(Operation::XaEnd {
                xid: xid.clone(),
                flag: EndFlag::Success,
            }))
            .await,
    );

    let prepared = core.handle(on(Operation::XaPrepare { xid: xid.clone() })).await;
    outcomes.record(&prepared);
    match prepared {
        Ok(ResponseBody::Vote(PrepareVote::Ok)) if rng.gen_bool(0.9) => {
            let committed = core.handle(on(Operation::XaCommit { xid, one_phase: false })).await;
            outcomes.record(&committed);
        }
        Ok(ResponseBody::Vote(PrepareVote::ReadOnly)) => {}
        _ => {
            outcomes.record(&core.handle(on(Operation::XaRollback { xid })).await);
        }
    }
}

fn execute(session: SessionId, backend: &str, rng: &mut StdRng) -> Request {
    let (sql, class_hint) = if rng.gen_bool(0.1) {
        ("SELECT sum(total) FROM orders GROUP BY region", Some(SlotClass::Slow))
    } else {
        ("SELECT * FROM orders WHERE id = ?", None)
    };
    Request::on(
        session,
        backend.to_string(),
        Operation::Execute {
            sql: sql.to_string(),
            params: Bytes::new(),
            class_hint,
        },
    )
}
