//! Transaction state machine.
//!
//! The canonical table of legal transitions lives in
//! [`TxnState::is_legal_transition`]; everything else is accessors. An
//! illegal transition under [`TransitionValidation::Validate`] is an
//! invariant violation and terminates the process. The relaxed mode
//! exists solely for refresh-from-storage, which reconstructs a
//! terminal `Committed` state from the oplog without replaying the
//! intermediate states.

use std::fmt;
use vellum_core::error::fatal;

/// The states a session's transaction can be in.
///
/// `None` encodes "no multi-statement transaction": the session is
/// either fresh or operating in retryable-write mode. It is reachable
/// from every terminal state so a new transaction number resets
/// cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStateKind {
    /// No multi-statement transaction.
    None,
    /// A multi-statement transaction is open.
    InProgress,
    /// Durably prepared, awaiting the cluster's commit or abort.
    Prepared,
    /// Committing directly, without a prepare phase.
    CommittingWithoutPrepare,
    /// Committing after a prepare phase.
    CommittingWithPrepare,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

impl fmt::Display for TxnStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnStateKind::None => "TxnState::None",
            TxnStateKind::InProgress => "TxnState::InProgress",
            TxnStateKind::Prepared => "TxnState::Prepared",
            TxnStateKind::CommittingWithoutPrepare => "TxnState::CommittingWithoutPrepare",
            TxnStateKind::CommittingWithPrepare => "TxnState::CommittingWithPrepare",
            TxnStateKind::Committed => "TxnState::Committed",
            TxnStateKind::Aborted => "TxnState::Aborted",
        };
        f.write_str(name)
    }
}

/// Whether a transition is checked against the legal-transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionValidation {
    /// Enforce the table; an illegal transition is fatal.
    Validate,
    /// Accept any transition. Used only by refresh-from-storage.
    Relaxed,
}

/// The session's transaction state, with guarded transitions.
#[derive(Debug, Default)]
pub struct TxnState {
    state: TxnStateKind,
}

impl Default for TxnStateKind {
    fn default() -> Self {
        TxnStateKind::None
    }
}

impl TxnState {
    /// Fresh state machine in `None`.
    pub fn new() -> Self {
        TxnState::default()
    }

    /// The current state.
    pub fn kind(&self) -> TxnStateKind {
        self.state
    }

    fn is_legal_transition(old_state: TxnStateKind, new_state: TxnStateKind) -> bool {
        use TxnStateKind::*;
        match old_state {
            None => matches!(new_state, None | InProgress),
            InProgress => matches!(
                new_state,
                None | Prepared | CommittingWithoutPrepare | Aborted
            ),
            Prepared => matches!(new_state, CommittingWithPrepare | Aborted),
            CommittingWithoutPrepare | CommittingWithPrepare => {
                matches!(new_state, None | Committed | Aborted)
            }
            Committed => matches!(new_state, None | InProgress),
            Aborted => matches!(new_state, None | InProgress),
        }
    }

    /// Move to `new_state`. Under [`TransitionValidation::Validate`] an
    /// illegal transition terminates the process.
    pub fn transition_to(&mut self, new_state: TxnStateKind, validation: TransitionValidation) {
        if validation == TransitionValidation::Validate
            && !Self::is_legal_transition(self.state, new_state)
        {
            fatal(
                50786,
                &format!(
                    "current state: {}, illegal attempted next state: {}",
                    self.state, new_state
                ),
            );
        }
        self.state = new_state;
    }

    /// In `None`.
    pub fn is_none(&self) -> bool {
        self.state == TxnStateKind::None
    }

    /// In `InProgress`.
    pub fn is_in_progress(&self) -> bool {
        self.state == TxnStateKind::InProgress
    }

    /// In `Prepared`.
    pub fn is_prepared(&self) -> bool {
        self.state == TxnStateKind::Prepared
    }

    /// In `CommittingWithoutPrepare`.
    pub fn is_committing_without_prepare(&self) -> bool {
        self.state == TxnStateKind::CommittingWithoutPrepare
    }

    /// In `CommittingWithPrepare`.
    pub fn is_committing_with_prepare(&self) -> bool {
        self.state == TxnStateKind::CommittingWithPrepare
    }

    /// In `Committed`.
    pub fn is_committed(&self) -> bool {
        self.state == TxnStateKind::Committed
    }

    /// In `Aborted`.
    pub fn is_aborted(&self) -> bool {
        self.state == TxnStateKind::Aborted
    }

    /// Whether the session is inside an open multi-statement
    /// transaction (in progress or prepared).
    pub fn in_multi_document_transaction(&self) -> bool {
        matches!(self.state, TxnStateKind::InProgress | TxnStateKind::Prepared)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.fmt(f)
    }
}
