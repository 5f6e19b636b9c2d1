//! Request dispatch
//!
//! Resolves the target session, locks it for the duration of the operation,
//! and routes the operation to the transaction coordinator.

use tokio::time::Instant;
use tracing::{debug, warn};

use super::request::{Operation, Request, Response, ResponseBody, SessionRef};
use crate::core::Core;
use crate::error::ProxyError;
use crate::pool::Fingerprint;
use crate::session::SessionKind;

/// Handle one request, logging failures at the level they deserve
pub async fn handle(core: &Core, request: Request) -> Response {
    let operation = request.operation.name();
    let backend = request.backend.clone();
    match dispatch(core, request).await {
        Ok(body) => Ok(body),
        Err(err) => {
            let kind = err.kind();
            if kind.is_transient() {
                warn!(backend = %backend, operation, kind = %kind, error = %err, "Request failed");
            } else {
                debug!(backend = %backend, operation, kind = %kind, error = %err, "Request rejected");
            }
            Err((&err).into())
        }
    }
}

/// Route a request to the component that serves it
pub async fn dispatch(core: &Core, request: Request) -> Result<ResponseBody, ProxyError> {
    let Request {
        session,
        backend,
        operation,
        deadline_hint: deadline,
    } = request;

    let id = match (session, &operation) {
        (SessionRef::New, Operation::Connect { distributed }) => {
            let kind = if *distributed {
                SessionKind::Distributed
            } else {
                SessionKind::Local
            };
            let session = core.sessions.open_with(&backend, kind)?;
            return Ok(ResponseBody::Connected { session });
        }
        (_, Operation::ClusterHealth { report }) => {
            let resized = core.cluster.apply_health_report(report).await?;
            return Ok(ResponseBody::Resized(resized));
        }
        (SessionRef::Existing(_), Operation::Connect { .. }) => {
            return Err(ProxyError::invalid("connect must not name an existing session"));
        }
        (SessionRef::New, op) => {
            return Err(ProxyError::invalid(format!("{} requires an open session", op.name())));
        }
        (SessionRef::Existing(id), _) => id,
    };

    if let Operation::Close = operation {
        core.sessions.close(&id).await?;
        return Ok(ResponseBody::Closed);
    }

    let handle = core.sessions.lookup(&id)?;
    let mut session = handle.lock().await;
    if !backend.is_empty() && &backend != session.backend() {
        return Err(ProxyError::invalid(format!(
            "session {} belongs to backend {}, not {}",
            id,
            session.backend(),
            backend
        )));
    }
    session.touch();

    let tx = &core.coordinator;
    let body = match operation {
        Operation::Execute { sql, params, class_hint } => {
            let backend = session.backend().clone();
            let fingerprint = Fingerprint::of(&sql);
            let class = class_hint.unwrap_or_else(|| core.pool.classify(&backend, &fingerprint));
            let started = Instant::now();
            let result = tx.execute(&mut session, &sql, &params, class, deadline).await;
            if result.is_ok() {
                core.pool.record_execution(&backend, &fingerprint, started.elapsed());
            }
            ResponseBody::Rows(result?)
        }
        Operation::Begin { isolation } => {
            tx.begin(&mut session, isolation, deadline).await?;
            ResponseBody::Ack
        }
        Operation::SetAutocommit { autocommit } => {
            tx.set_autocommit(&mut session, autocommit).await?;
            ResponseBody::Ack
        }
        Operation::Commit => {
            tx.commit(&mut session).await?;
            ResponseBody::Ack
        }
        Operation::Rollback => {
            tx.rollback(&mut session).await?;
            ResponseBody::Ack
        }
        Operation::XaStart { xid, flag } => {
            tx.xa_start(&mut session, xid, flag, deadline).await?;
            ResponseBody::Ack
        }
        Operation::XaEnd { xid, flag } => {
            tx.xa_end(&mut session, &xid, flag).await?;
            ResponseBody::Ack
        }
        Operation::XaPrepare { xid } => ResponseBody::Vote(tx.xa_prepare(&mut session, &xid, deadline).await?),
        Operation::XaCommit { xid, one_phase } => {
            tx.xa_commit(&mut session, &xid, one_phase, deadline).await?;
            ResponseBody::Ack
        }
        Operation::XaRollback { xid } => {
            tx.xa_rollback(&mut session, &xid, deadline).await?;
            ResponseBody::Ack
        }
        Operation::XaForget { xid } => {
            tx.xa_forget(&mut session, &xid, deadline).await?;
            ResponseBody::Ack
        }
        Operation::XaRecover => ResponseBody::Recovered(tx.xa_recover(&mut session, deadline).await?),
        Operation::Connect { .. } | Operation::ClusterHealth { .. } | Operation::Close => {
            return Err(ProxyError::invalid("operation handled before session lookup"));
        }
    };
    Ok(body)
}
