//! Distributed transaction branch state machine

use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

use super::TxError;
use crate::backend::{BackendId, Xid};

/// Phase of one enlisted branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPhase {
    Active,
    Suspended,
    /// Dissociated after a successful or failed end
    Ended,
    Prepared,
    Committed,
    RolledBack,
    Heuristic,
    Forgotten,
}

impl BranchPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, BranchPhase::Committed | BranchPhase::RolledBack | BranchPhase::Forgotten)
    }

    /// Branch may still be prepared or committed by its manager
    pub fn is_in_doubt(self) -> bool {
        matches!(self, BranchPhase::Ended | BranchPhase::Prepared | BranchPhase::Heuristic)
    }

    pub fn can_transition(self, to: BranchPhase) -> bool {
        use BranchPhase::*;
        matches!(
            (self, to),
            (Active, Suspended)
                | (Active, Ended)
                | (Active, RolledBack)
                | (Suspended, Active)
                | (Suspended, Ended)
                | (Suspended, RolledBack)
                | (Ended, Active)
                | (Ended, Prepared)
                | (Ended, Committed)
                | (Ended, RolledBack)
                | (Ended, Heuristic)
                | (Prepared, Committed)
                | (Prepared, RolledBack)
                | (Prepared, Heuristic)
                | (Heuristic, Forgotten)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BranchPhase::Active => "active",
            BranchPhase::Suspended => "suspended",
            BranchPhase::Ended => "ended",
            BranchPhase::Prepared => "prepared",
            BranchPhase::Committed => "committed",
            BranchPhase::RolledBack => "rolledback",
            BranchPhase::Heuristic => "heuristic",
            BranchPhase::Forgotten => "forgotten",
        }
    }
}

impl fmt::Display for BranchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a branch association is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFlag {
    /// New branch
    New,
    /// Re-associate with an ended branch
    Join,
    /// Re-associate with a suspended branch
    Resume,
}

/// How a branch association is ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndFlag {
    Success,
    /// Work failed; the branch may only be rolled back
    Fail,
    Suspend,
}

/// State of the branch a session works on
#[derive(Debug, Clone)]
pub struct BranchContext {
    pub xid: Xid,
    pub backend: BackendId,
    phase: BranchPhase,
    rollback_only: bool,
    read_only: bool,
    recovered: bool,
    started_at: Instant,
    last_transition: Instant,
}

impl BranchContext {
    pub fn new(xid: Xid, backend: BackendId) -> Self {
        let now = Instant::now();
        Self {
            xid,
            backend,
            phase: BranchPhase::Active,
            rollback_only: false,
            read_only: false,
            recovered: false,
            started_at: now,
            last_transition: now,
        }
    }

    /// Context for a branch this coordinator did not start, such as one
    /// found by a recovery scan
    pub fn recovered(xid: Xid, backend: BackendId, phase: BranchPhase) -> Self {
        let mut branch = Self::new(xid, backend);
        branch.phase = phase;
        branch.recovered = true;
        branch
    }

    /// Context for a branch that completed earlier, rebuilt from its record
    pub(crate) fn completed(xid: Xid, backend: BackendId, phase: BranchPhase, read_only: bool) -> Self {
        let mut branch = Self::new(xid, backend);
        branch.phase = phase;
        branch.read_only = read_only;
        branch
    }

    pub fn phase(&self) -> BranchPhase {
        self.phase
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Completed through a read-only prepare vote
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Not started here; its phase is assumed rather than observed
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Time since the last phase change
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Check a transition without applying it
    pub fn check(&self, to: BranchPhase) -> Result<(), TxError> {
        if self.phase.can_transition(to) {
            Ok(())
        } else {
            Err(TxError::ProtocolViolation {
                backend: self.backend.clone(),
                xid: Some(self.xid.clone()),
                phase: Some(self.phase),
                detail: format!("branch {} cannot move from {} to {}", self.xid, self.phase, to),
            })
        }
    }

    pub fn transition(&mut self, to: BranchPhase) -> Result<(), TxError> {
        self.check(to)?;
        self.phase = to;
        self.last_transition = Instant::now();
        Ok(())
    }

    pub(crate) fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub(crate) fn complete_read_only(&mut self) {
        self.read_only = true;
        self.phase = BranchPhase::Committed;
        self.last_transition = Instant::now();
    }

    /// Record an outcome reported by the backend, bypassing the table
    pub(crate) fn force(&mut self, to: BranchPhase) {
        self.phase = to;
        self.last_transition = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BranchContext {
        BranchContext::new(Xid::new(1, b"g".to_vec(), b"b".to_vec()), "db1".to_string())
    }

    #[test]
    fn test_two_phase_path() {
        let mut branch = ctx();
        branch.transition(BranchPhase::Ended).unwrap();
        branch.transition(BranchPhase::Prepared).unwrap();
        branch.transition(BranchPhase::Committed).unwrap();
        assert!(branch.phase().is_terminal());
    }

    #[test]
    fn test_suspend_resume() {
        let mut branch = ctx();
        branch.transition(BranchPhase::Suspended).unwrap();
        branch.transition(BranchPhase::Active).unwrap();
        branch.transition(BranchPhase::Ended).unwrap();
        branch.transition(BranchPhase::Committed).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut branch = ctx();
        assert!(matches!(
            branch.transition(BranchPhase::Prepared),
            Err(TxError::ProtocolViolation { phase: Some(BranchPhase::Active), .. })
        ));
        branch.transition(BranchPhase::Ended).unwrap();
        branch.transition(BranchPhase::Prepared).unwrap();
        assert!(branch.transition(BranchPhase::Active).is_err());
        assert!(branch.transition(BranchPhase::Forgotten).is_err());
    }

    #[test]
    fn test_forget_only_after_heuristic() {
        let mut branch = ctx();
        branch.transition(BranchPhase::Ended).unwrap();
        branch.transition(BranchPhase::Prepared).unwrap();
        branch.transition(BranchPhase::Heuristic).unwrap();
        assert!(!branch.phase().is_terminal());
        branch.transition(BranchPhase::Forgotten).unwrap();
        assert!(branch.phase().is_terminal());
    }

    #[test]
    fn test_terminal_phases_are_final() {
        for terminal in [BranchPhase::Committed, BranchPhase::RolledBack, BranchPhase::Forgotten] {
            for to in [BranchPhase::Active, BranchPhase::Prepared, BranchPhase::Committed, BranchPhase::RolledBack] {
                assert!(!terminal.can_transition(to));
            }
        }
    }
}
