//! Deadline-bounded acquisition
//!
//! The acquisition itself runs in a spawned worker task while the caller
//! waits on a oneshot channel under its own timeout. The caller therefore
//! returns at the deadline no matter what the worker is blocked on. A worker
//! that obtains a connection after its caller has gone hands it straight
//! back to the pool.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::circuit::Admission;
use super::classifier::SlotClass;
use super::connection::Lease;
use super::subpool::BackendPool;
use super::PoolError;

pub(crate) type LeaseSender = oneshot::Sender<Result<Lease, PoolError>>;

const WAITING: u8 = 0;
const CONNECTING: u8 = 1;
const JUDGED: u8 = 2;

/// What the worker was doing, and whether the circuit has been told
#[derive(Debug)]
pub(crate) struct AcquireProgress(AtomicU8);

impl AcquireProgress {
    fn new() -> Self {
        Self(AtomicU8::new(WAITING))
    }

    /// Mark that the worker is talking to the backend
    pub(crate) fn connecting(&self) {
        let _ = self
            .0
            .compare_exchange(WAITING, CONNECTING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Claim the right to report the outcome; returns the prior phase
    fn judge(&self) -> u8 {
        self.0.swap(JUDGED, Ordering::AcqRel)
    }
}

/// Acquire a lease from `pool`, failing once `deadline` has passed
pub(crate) async fn acquire_bounded(
    pool: Arc<BackendPool>,
    class: SlotClass,
    deadline: Duration,
) -> Result<Lease, PoolError> {
    let admission = pool.circuit.check_request().map_err(|e| {
        pool.record_circuit_rejection();
        PoolError::from(e)
    })?;

    let progress = Arc::new(AcquireProgress::new());
    let (tx, rx) = oneshot::channel();

    let worker_pool = pool.clone();
    let worker_progress = progress.clone();
    tokio::spawn(async move {
        let mut tx = tx;
        let outcome = worker_pool.acquire_slot(class, &worker_progress, &mut tx).await;
        report_outcome(&worker_pool, &worker_progress, admission, &outcome);
        if let Err(Ok(lease)) = tx.send(outcome) {
            worker_pool.return_unused(lease);
        }
    });

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(PoolError::ShuttingDown),
        Err(_) => {
            pool.record_timeout();
            match progress.judge() {
                CONNECTING => {
                    warn!(
                        backend = %pool.id(),
                        deadline_ms = deadline.as_millis() as u64,
                        "Backend unresponsive while opening or validating a connection"
                    );
                    pool.circuit.record_failure(admission);
                }
                WAITING if admission == Admission::Probe => pool.circuit.release_probe(),
                _ => {}
            }
            debug!(backend = %pool.id(), class = %class, "Acquisition deadline reached");
            Err(PoolError::AcquisitionTimeout {
                backend: pool.id().clone(),
                class,
                waited: deadline,
            })
        }
    }
}

fn report_outcome(
    pool: &BackendPool,
    progress: &AcquireProgress,
    admission: Admission,
    outcome: &Result<Lease, PoolError>,
) {
    if progress.judge() == JUDGED {
        return;
    }
    match outcome {
        Ok(_) => pool.circuit.record_success(admission),
        Err(PoolError::ValidationFailure { .. }) | Err(PoolError::ConnectionFailed { .. }) => {
            pool.circuit.record_failure(admission)
        }
        Err(_) => {
            if admission == Admission::Probe {
                pool.circuit.release_probe();
            }
        }
    }
}
