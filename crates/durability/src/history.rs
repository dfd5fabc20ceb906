//! Durable history loader.
//!
//! Rebuilds a session's committed-statement map by reading its row in
//! the session-records collection and walking the back-linked oplog
//! chain from the row's last write. Runs without the session mutex;
//! the caller installs the result under the mutex after re-checking
//! that no invalidation raced the load.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use vellum_core::error::{fassert_on_repeated_execution, fatal, Result};
use vellum_core::record::{is_dead_end_sentinel, OplogEntry, SessionRecord};
use vellum_core::traits::{OplogReader, RecordStore};
use vellum_core::types::{OpTime, SessionId, StmtId, INCOMPLETE_HISTORY_STMT_ID};

/// Walks a session's oplog chain backwards, following each entry's
/// `prev_op_time` link.
pub struct TransactionHistoryIterator<'a> {
    oplog: &'a dyn OplogReader,
    next_op_time: Option<OpTime>,
}

impl<'a> TransactionHistoryIterator<'a> {
    /// Start a walk at `start`.
    pub fn new(oplog: &'a dyn OplogReader, start: OpTime) -> Self {
        TransactionHistoryIterator {
            oplog,
            next_op_time: (!start.is_null()).then_some(start),
        }
    }

    /// Whether another entry remains on the chain.
    pub fn has_next(&self) -> bool {
        self.next_op_time.is_some()
    }

    /// Fetch the next entry and advance down the chain.
    ///
    /// # Errors
    ///
    /// [`vellum_core::Error::IncompleteTransactionHistory`] when the
    /// entry has been truncated away, or any other oplog read failure.
    pub fn next_entry(&mut self) -> Result<OplogEntry> {
        let op_time = match self.next_op_time {
            Some(op_time) => op_time,
            None => fatal(50740, "transaction history iterator walked past the chain end"),
        };
        let entry = self.oplog.fetch(op_time)?;
        self.next_op_time = entry.prev_op_time.filter(|prev| !prev.is_null());
        Ok(entry)
    }
}

/// Everything the loader learned about a session's active transaction.
#[derive(Debug, Default)]
pub struct ActiveTransactionHistory {
    /// The durable row, when one exists.
    pub last_record: Option<SessionRecord>,
    /// Statement id to commit optime, for the row's transaction number.
    pub committed_statements: HashMap<StmtId, OpTime>,
    /// Whether the chain contains a transaction-commit entry.
    pub transaction_committed: bool,
    /// Whether the chain was truncated before its beginning.
    pub has_incomplete_history: bool,
}

/// Load the durable history for `session_id`.
///
/// A session with no durable row yields an empty result. A sentinel
/// entry must carry the dead-end object, and a statement id appearing
/// twice on the chain is treated as data corruption; both violations
/// are process-fatal.
///
/// # Errors
///
/// Oplog or record-store read failures other than history truncation
/// (truncation is folded into `has_incomplete_history`).
pub fn fetch_active_transaction_history(
    records: &dyn RecordStore,
    oplog: &dyn OplogReader,
    session_id: &SessionId,
) -> Result<ActiveTransactionHistory> {
    let mut result = ActiveTransactionHistory::default();

    let record_id = match records.find_id(session_id) {
        Some(record_id) => record_id,
        None => return Ok(result),
    };
    let (record, _version) = records.read(&record_id)?;
    let mut iter = TransactionHistoryIterator::new(oplog, record.last_write_op_time);
    result.last_record = Some(record.clone());

    while iter.has_next() {
        let entry = match iter.next_entry() {
            Ok(entry) => entry,
            Err(err) if err.is_incomplete_history() => {
                result.has_incomplete_history = true;
                break;
            }
            Err(err) => return Err(err),
        };

        let stmt_id = match entry.stmt_id {
            Some(stmt_id) => stmt_id,
            None => fatal(50741, "oplog entry in a session chain is missing its statement id"),
        };

        if stmt_id == INCOMPLETE_HISTORY_STMT_ID {
            // Only the dead-end sentinel may carry this id.
            match entry.object2.as_ref() {
                Some(object) if is_dead_end_sentinel(object) => {}
                _ => fatal(
                    50742,
                    "sentinel statement id without the dead-end sentinel object",
                ),
            }
            result.has_incomplete_history = true;
            continue;
        }

        match result.committed_statements.entry(stmt_id) {
            Entry::Occupied(existing) => {
                fassert_on_repeated_execution(
                    session_id,
                    record.txn_num,
                    stmt_id,
                    *existing.get(),
                    entry.op_time,
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.op_time);
            }
        }

        if entry.is_transaction_commit() {
            result.transaction_committed = true;
        }
    }

    tracing::debug!(
        %session_id,
        statements = result.committed_statements.len(),
        transaction_committed = result.transaction_committed,
        incomplete = result.has_incomplete_history,
        "loaded durable session history"
    );
    Ok(result)
}
