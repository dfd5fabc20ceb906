//! Error types for the session layer.
//!
//! One `thiserror`-derived enum covers every error kind surfaced at the
//! session boundary. Three failure classes are handled distinctly:
//!
//! - **User errors** (wrong command in a transaction, bad transaction
//!   number, wrong state) return a typed variant and leave session state
//!   untouched.
//! - **Storage and lock failures** ([`Error::WriteConflict`],
//!   [`Error::LockTimeout`]) are retryable: the write unit of work
//!   discards its writes and the caller retries under a new snapshot.
//! - **Invariant violations** (repeated execution of a statement id,
//!   illegal state transition, missing session-records collection) are
//!   process-fatal and funnel through [`fatal`] /
//!   [`fassert_on_repeated_execution`].

use crate::types::{OpTime, SessionId, StmtId, TxnNumber};
use thiserror::Error;

/// Result type alias for session-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced at the session boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied transaction number is older than the session's
    /// active one.
    #[error("cannot start transaction {txn_number} on session {session_id} because a newer transaction {active_txn_number} has already started")]
    TransactionTooOld {
        /// Session the stale number was supplied for.
        session_id: SessionId,
        /// The stale number.
        txn_number: TxnNumber,
        /// The session's current active number.
        active_txn_number: TxnNumber,
    },

    /// The referenced transaction does not exist or has been aborted.
    #[error("no such transaction: {message}")]
    NoSuchTransaction {
        /// What was looked for and why it is gone.
        message: String,
    },

    /// The transaction has already committed and cannot be changed.
    #[error("transaction {txn_number} has been committed")]
    TransactionCommitted {
        /// The committed transaction.
        txn_number: TxnNumber,
    },

    /// The in-memory operation buffer exceeded its size cap.
    #[error("total size of all transaction operations must be less than {limit}, actual size is {size}")]
    TransactionTooLarge {
        /// Running buffer size after the rejected append.
        size: usize,
        /// The cap.
        limit: usize,
    },

    /// Another operation raced with this one on the same session; the
    /// caller must retry.
    #[error("conflicting operation in progress: {message}")]
    ConflictingOperationInProgress {
        /// What conflicted.
        message: String,
    },

    /// The command is not allowed inside a multi-statement transaction.
    #[error("operation not supported in transaction: {message}")]
    OperationNotSupportedInTransaction {
        /// Which command or database was rejected.
        message: String,
    },

    /// Invalid combination of options on the request.
    #[error("invalid options: {message}")]
    InvalidOptions {
        /// What was wrong.
        message: String,
    },

    /// The durable history chain was truncated before the point of
    /// interest; at-most-once execution can no longer be verified.
    #[error("incomplete transaction history: {message}")]
    IncompleteTransactionHistory {
        /// What could not be resolved.
        message: String,
    },

    /// The target document changed under the operation's snapshot; the
    /// caller must retry under a new snapshot.
    #[error("write conflict: {message}")]
    WriteConflict {
        /// What conflicted.
        message: String,
    },

    /// Insert hit an existing key in a unique index.
    #[error("duplicate key: {message}")]
    DuplicateKey {
        /// Which key.
        message: String,
    },

    /// A lock request exceeded the transaction lock timeout cap.
    #[error("lock timeout: {message}")]
    LockTimeout {
        /// Which lock and cap.
        message: String,
    },

    /// Error injected by a test failpoint.
    #[error("failpoint error {code}: {message}")]
    FailPointError {
        /// The configured error code.
        code: i32,
        /// Why the failpoint fired.
        message: String,
    },

    /// Unexpected internal state; indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the broken expectation.
        message: String,
    },
}

impl Error {
    /// A [`Error::NoSuchTransaction`] for a transaction that was aborted.
    pub fn transaction_aborted(txn_number: TxnNumber) -> Self {
        Error::NoSuchTransaction {
            message: format!("transaction {txn_number} has been aborted"),
        }
    }

    /// A [`Error::NoSuchTransaction`] with a free-form reason.
    pub fn no_such_transaction(message: impl Into<String>) -> Self {
        Error::NoSuchTransaction {
            message: message.into(),
        }
    }

    /// A [`Error::ConflictingOperationInProgress`].
    pub fn conflicting_operation(message: impl Into<String>) -> Self {
        Error::ConflictingOperationInProgress {
            message: message.into(),
        }
    }

    /// An [`Error::OperationNotSupportedInTransaction`].
    pub fn not_supported_in_transaction(message: impl Into<String>) -> Self {
        Error::OperationNotSupportedInTransaction {
            message: message.into(),
        }
    }

    /// An [`Error::InvalidOptions`].
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Error::InvalidOptions {
            message: message.into(),
        }
    }

    /// A [`Error::WriteConflict`].
    pub fn write_conflict(message: impl Into<String>) -> Self {
        Error::WriteConflict {
            message: message.into(),
        }
    }

    /// A [`Error::DuplicateKey`].
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Error::DuplicateKey {
            message: message.into(),
        }
    }

    /// A [`Error::LockTimeout`].
    pub fn lock_timeout(message: impl Into<String>) -> Self {
        Error::LockTimeout {
            message: message.into(),
        }
    }

    /// An [`Error::IncompleteTransactionHistory`].
    pub fn incomplete_history(message: impl Into<String>) -> Self {
        Error::IncompleteTransactionHistory {
            message: message.into(),
        }
    }

    /// An [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is a write conflict.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict { .. })
    }

    /// Whether this error is a duplicate-key failure.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Error::DuplicateKey { .. })
    }

    /// Whether the operation may succeed if retried under fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriteConflict { .. }
                | Error::LockTimeout { .. }
                | Error::ConflictingOperationInProgress { .. }
        )
    }

    /// Whether this error reports a truncated durable history.
    pub fn is_incomplete_history(&self) -> bool {
        matches!(self, Error::IncompleteTransactionHistory { .. })
    }

    /// Short stable name of the error kind, for logs and reports.
    pub fn code_name(&self) -> &'static str {
        match self {
            Error::TransactionTooOld { .. } => "TransactionTooOld",
            Error::NoSuchTransaction { .. } => "NoSuchTransaction",
            Error::TransactionCommitted { .. } => "TransactionCommitted",
            Error::TransactionTooLarge { .. } => "TransactionTooLarge",
            Error::ConflictingOperationInProgress { .. } => "ConflictingOperationInProgress",
            Error::OperationNotSupportedInTransaction { .. } => {
                "OperationNotSupportedInTransaction"
            }
            Error::InvalidOptions { .. } => "InvalidOptions",
            Error::IncompleteTransactionHistory { .. } => "IncompleteTransactionHistory",
            Error::WriteConflict { .. } => "WriteConflict",
            Error::DuplicateKey { .. } => "DuplicateKey",
            Error::LockTimeout { .. } => "LockTimeout",
            Error::FailPointError { .. } => "FailPointError",
            Error::Internal { .. } => "Internal",
        }
    }
}

/// Terminate the process over a broken invariant.
///
/// `code` is a stable number identifying the assertion site, carried in
/// the panic message so crash reports can be matched across versions.
pub fn fatal(code: u32, message: &str) -> ! {
    tracing::error!(code, message, "fatal assertion");
    panic!("fatal assertion {code}: {message}");
}

/// Terminate the process because the same statement id committed twice.
///
/// Repeated execution of a retryable statement is the exact corruption
/// this layer exists to prevent; there is no recovery.
pub fn fassert_on_repeated_execution(
    session_id: &SessionId,
    txn_number: TxnNumber,
    stmt_id: StmtId,
    first_op_time: OpTime,
    second_op_time: OpTime,
) -> ! {
    fatal(
        40526,
        &format!(
            "statement id {stmt_id} from transaction [ {session_id}:{txn_number} ] was committed \
             once with opTime {first_op_time} and a second time with opTime {second_op_time}; \
             this indicates possible data corruption or a server bug"
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    #[test]
    fn test_error_display_transaction_too_old() {
        let err = Error::TransactionTooOld {
            session_id: SessionId::new(),
            txn_number: 4,
            active_txn_number: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("transaction 4"));
        assert!(msg.contains("newer transaction 7"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::write_conflict("doc moved").is_retryable());
        assert!(Error::lock_timeout("global IX").is_retryable());
        assert!(!Error::invalid_options("bad").is_retryable());
        assert!(!Error::transaction_aborted(3).is_retryable());
    }

    #[test]
    fn test_code_names_are_stable() {
        assert_eq!(
            Error::transaction_aborted(1).code_name(),
            "NoSuchTransaction"
        );
        assert_eq!(
            Error::TransactionCommitted { txn_number: 1 }.code_name(),
            "TransactionCommitted"
        );
    }

    #[test]
    #[should_panic(expected = "40526")]
    fn test_repeated_execution_is_fatal() {
        fassert_on_repeated_execution(
            &SessionId::new(),
            5,
            1,
            OpTime::new(Timestamp(10), 1),
            OpTime::new(Timestamp(11), 1),
        );
    }
}
