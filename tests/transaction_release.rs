//! Connection release around distributed transactions
//!
//! A connection enlisted in a branch goes back to the pool only once the
//! branch has completed and the session has closed, whichever happens last.
//! Every test runs against a single-connection backend so that premature
//! reuse shows up as a second session getting the connection.

use bytes::Bytes;
use sqlpool::backend::{MemoryBackend, PrepareVote, Xid};
use sqlpool::config::BackendConfig;
use sqlpool::proxy::{Operation, Request, ResponseBody};
use sqlpool::session::SessionId;
use sqlpool::txn::{EndFlag, StartFlag};
use sqlpool::{Config, Core, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

const BACKEND: &str = "orders";

async fn single_connection_core() -> (Core, MemoryBackend) {
    let mut config = Config::new();
    config.backends.push(BackendConfig {
        id: BACKEND.to_string(),
        url: "mem://orders".to_string(),
        max_connections: Some(1),
    });
    let backend = MemoryBackend::new();
    let core = Core::new(config, Arc::new(backend.clone())).await.unwrap();
    (core, backend)
}

async fn connect(core: &Core, distributed: bool) -> SessionId {
    match core.handle(Request::connect(BACKEND, distributed)).await {
        Ok(ResponseBody::Connected { session }) => session,
        other => panic!("connect failed: {:?}", other),
    }
}

async fn send(core: &Core, session: SessionId, operation: Operation) -> ResponseBody {
    let name = operation.name();
    core.handle(Request::on(session, BACKEND, operation))
        .await
        .unwrap_or_else(|e| panic!("{} failed: {:?}", name, e))
}

fn execute() -> Operation {
    Operation::Execute {
        sql: "UPDATE stock SET qty = qty - 1 WHERE sku = ?".to_string(),
        params: Bytes::from_static(b"A-1"),
        class_hint: None,
    }
}

/// Start a branch, run one statement and end the association
async fn work_on_branch(core: &Core, session: SessionId, xid: &Xid) {
    send(
        core,
        session,
        Operation::XaStart {
            xid: xid.clone(),
            flag: StartFlag::New,
        },
    )
    .await;
    send(core, session, execute()).await;
    send(
        core,
        session,
        Operation::XaEnd {
            xid: xid.clone(),
            flag: EndFlag::Success,
        },
    )
    .await;
}

/// Whether another session can get the backend's only connection
async fn connection_available(core: &Core) -> bool {
    let other = connect(core, false).await;
    let result = core
        .handle(Request::on(other, BACKEND, execute()).with_deadline(Duration::from_millis(100)))
        .await;
    send(core, other, Operation::Close).await;
    // Let an abandoned acquisition worker notice its caller is gone
    tokio::time::sleep(Duration::from_millis(10)).await;
    match result {
        Ok(_) => true,
        Err(e) if e.kind == ErrorKind::AcquisitionTimeout => false,
        Err(e) => panic!("unexpected error: {:?}", e),
    }
}

fn pending(core: &Core) -> (usize, usize, usize) {
    let stats = core.pool.get_stats(BACKEND).unwrap();
    (stats.leased, stats.pending_release, stats.idle)
}

#[tokio::test(start_paused = true)]
async fn test_branch_completes_before_session_closes() {
    let (core, backend) = single_connection_core().await;
    let xid = Xid::new(1, b"order-1001".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    work_on_branch(&core, session, &xid).await;
    assert!(matches!(
        send(&core, session, Operation::XaPrepare { xid: xid.clone() }).await,
        ResponseBody::Vote(PrepareVote::Ok)
    ));
    send(
        &core,
        session,
        Operation::XaCommit {
            xid: xid.clone(),
            one_phase: false,
        },
    )
    .await;

    // Branch is done but the session is still open
    assert_eq!(pending(&core), (0, 1, 0));
    assert!(!connection_available(&core).await);

    send(&core, session, Operation::Close).await;
    assert_eq!(pending(&core), (0, 0, 1));
    assert!(connection_available(&core).await);
    assert_eq!(backend.stats(BACKEND).branch_commits, 1);
    assert_eq!(backend.stats(BACKEND).opened, 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_closes_before_branch_completes() {
    let (core, backend) = single_connection_core().await;
    let xid = Xid::new(1, b"order-1002".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    work_on_branch(&core, session, &xid).await;
    send(&core, session, Operation::XaPrepare { xid: xid.clone() }).await;
    send(&core, session, Operation::Close).await;

    // Session is gone but the branch is in doubt
    assert_eq!(core.coordinator.held_count(), 1);
    assert_eq!(core.snapshot().held_branches[0].backend, BACKEND);
    assert_eq!(pending(&core), (0, 1, 0));
    assert!(!connection_available(&core).await);

    // The transaction manager finishes the branch from another session
    let manager = connect(&core, true).await;
    send(
        &core,
        manager,
        Operation::XaCommit {
            xid: xid.clone(),
            one_phase: false,
        },
    )
    .await;

    assert_eq!(core.coordinator.held_count(), 0);
    assert_eq!(pending(&core), (0, 0, 1));
    assert!(connection_available(&core).await);
    assert_eq!(backend.stats(BACKEND).branch_commits, 1);
    send(&core, manager, Operation::Close).await;
}

#[tokio::test(start_paused = true)]
async fn test_read_only_branch_waits_for_close() {
    let (core, backend) = single_connection_core().await;
    backend.set_prepare_vote(BACKEND, PrepareVote::ReadOnly);
    let xid = Xid::new(1, b"report-7".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    work_on_branch(&core, session, &xid).await;
    assert!(matches!(
        send(&core, session, Operation::XaPrepare { xid: xid.clone() }).await,
        ResponseBody::Vote(PrepareVote::ReadOnly)
    ));

    assert_eq!(pending(&core), (0, 1, 0));
    send(&core, session, Operation::Close).await;
    assert_eq!(pending(&core), (0, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_unfinished_branch_rolls_back_on_close() {
    let (core, backend) = single_connection_core().await;
    let xid = Xid::new(1, b"order-1003".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    send(
        &core,
        session,
        Operation::XaStart {
            xid: xid.clone(),
            flag: StartFlag::New,
        },
    )
    .await;
    send(&core, session, execute()).await;
    assert_eq!(pending(&core), (1, 0, 0));

    send(&core, session, Operation::Close).await;
    assert_eq!(core.coordinator.held_count(), 0);
    assert_eq!(pending(&core), (0, 0, 1));
    assert_eq!(backend.stats(BACKEND).branch_rollbacks, 1);
    assert_eq!(backend.branch_count(BACKEND), 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_reuses_its_connection_for_next_branch() {
    let (core, _backend) = single_connection_core().await;
    let first = Xid::new(1, b"batch-1".to_vec(), b"orders".to_vec());
    let second = Xid::new(1, b"batch-2".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    work_on_branch(&core, session, &first).await;
    send(
        &core,
        session,
        Operation::XaCommit {
            xid: first,
            one_phase: true,
        },
    )
    .await;
    assert_eq!(pending(&core), (0, 1, 0));

    // The quarantined connection goes back into service for the same session
    work_on_branch(&core, session, &second).await;
    assert_eq!(pending(&core), (1, 0, 0));
    send(&core, session, Operation::XaRollback { xid: second }).await;
    send(&core, session, Operation::Close).await;
    assert_eq!(pending(&core), (0, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_ended_branch_is_rolled_back() {
    let (core, backend) = single_connection_core().await;
    let xid = Xid::new(1, b"order-1004".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    work_on_branch(&core, session, &xid).await;
    send(&core, session, Operation::Close).await;
    assert_eq!(core.coordinator.held_count(), 1);

    assert_eq!(core.coordinator.sweep_held().await, 0);
    tokio::time::advance(core.config.tx_config().abandoned_branch_timeout + Duration::from_secs(1)).await;
    assert_eq!(core.coordinator.sweep_held().await, 1);

    assert_eq!(core.coordinator.held_count(), 0);
    assert_eq!(pending(&core), (0, 0, 1));
    assert_eq!(backend.stats(BACKEND).branch_rollbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_after_held_branch_committed_is_refused() {
    let (core, backend) = single_connection_core().await;
    let xid = Xid::new(1, b"order-1005".to_vec(), b"orders".to_vec());

    let session = connect(&core, true).await;
    work_on_branch(&core, session, &xid).await;
    send(&core, session, Operation::XaPrepare { xid: xid.clone() }).await;
    send(&core, session, Operation::Close).await;

    let manager = connect(&core, true).await;
    send(
        &core,
        manager,
        Operation::XaCommit {
            xid: xid.clone(),
            one_phase: false,
        },
    )
    .await;

    let err = core
        .handle(Request::on(manager, BACKEND, Operation::XaRollback { xid: xid.clone() }))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BranchProtocolViolation);
    assert_eq!(backend.stats(BACKEND).branch_commits, 1);
    assert_eq!(backend.stats(BACKEND).branch_rollbacks, 0);

    // Repeating the commit is still answered as done
    send(&core, manager, Operation::XaCommit { xid, one_phase: false }).await;
    send(&core, manager, Operation::Close).await;
    assert_eq!(pending(&core), (0, 0, 1));
}
