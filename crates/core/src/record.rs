//! Durable record shapes: the session-records row, oplog entries, and
//! the in-memory write descriptors buffered by multi-statement
//! transactions.

use crate::types::{OpTime, SessionId, StmtId, TxnNumber, WallTime};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Name of the durable collection holding one record per session.
pub const SESSION_RECORDS_COLLECTION: &str = "system.session_records";

/// One row of the session-records collection, keyed by session id.
///
/// Mirrors the durable state exactly: the highest transaction number the
/// session has durably written under, and the optime/date of its most
/// recent write. The paired oplog entries form a back-linked chain via
/// each entry's `prev_op_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The session this row belongs to (`_id` of the collection).
    pub session_id: SessionId,
    /// Highest transaction number durably written.
    pub txn_num: TxnNumber,
    /// Optime of the most recent write for `txn_num`.
    pub last_write_op_time: OpTime,
    /// Wall-clock date of the most recent write.
    pub last_write_date: WallTime,
}

/// Kind of a buffered write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Document insert.
    Insert,
    /// Document update.
    Update,
    /// Document delete.
    Delete,
}

/// In-memory descriptor of one write buffered by a multi-statement
/// transaction, later handed to the op-observer for oplog emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplOperation {
    /// Target collection namespace.
    pub namespace: String,
    /// What the operation does.
    pub kind: OperationKind,
    /// The operation's payload document.
    pub document: Value,
}

impl ReplOperation {
    /// Build an insert descriptor.
    pub fn insert(namespace: impl Into<String>, document: Value) -> Self {
        ReplOperation {
            namespace: namespace.into(),
            kind: OperationKind::Insert,
            document,
        }
    }

    /// In-memory footprint of the operation, used to bound the
    /// transaction's operation buffer.
    pub fn size_bytes(&self) -> usize {
        self.namespace.len() + self.document.to_string().len()
    }
}

/// Command kinds that can appear in a session's oplog chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// The atomic apply-ops entry that marks the commit of a
    /// multi-statement transaction.
    ApplyOps,
}

/// Body of an oplog entry in a session's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OplogEntryBody {
    /// A single replicated write.
    Write(ReplOperation),
    /// A command entry.
    Command(CommandKind),
    /// A no-op entry; carries sentinels and migration markers.
    Noop,
}

/// One entry of the replicated oplog, restricted to the fields the
/// session layer reads when rebuilding history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Position of this entry in the log.
    pub op_time: OpTime,
    /// Back-link to the session's previous entry; `None` terminates the
    /// chain.
    pub prev_op_time: Option<OpTime>,
    /// Session the entry belongs to.
    pub session_id: SessionId,
    /// Transaction number the entry was written under, when the write
    /// was transactional.
    pub txn_number: Option<TxnNumber>,
    /// Statement id of the write, when the entry is part of a retryable
    /// history chain.
    pub stmt_id: Option<StmtId>,
    /// Wall-clock time the entry was written.
    pub wall_clock_time: WallTime,
    /// What the entry carries.
    pub body: OplogEntryBody,
    /// Secondary object; the dead-end sentinel rides here.
    pub object2: Option<Value>,
}

impl OplogEntry {
    /// Whether this entry marks the commit of a multi-statement
    /// transaction.
    pub fn is_transaction_commit(&self) -> bool {
        matches!(self.body, OplogEntryBody::Command(CommandKind::ApplyOps))
    }
}

/// The fixed dead-end sentinel object stored in an entry's secondary
/// object with [`crate::types::INCOMPLETE_HISTORY_STMT_ID`], marking the
/// point where the chain was truncated.
pub static DEAD_END_SENTINEL: Lazy<Value> = Lazy::new(|| json!({ "$incompleteOplogHistory": 1 }));

/// Whether `value` equals the dead-end sentinel.
pub fn is_dead_end_sentinel(value: &Value) -> bool {
    *value == *DEAD_END_SENTINEL
}

/// Arguments handed to the record store alongside an in-place update so
/// the op-observer can emit the paired oplog entry.
#[derive(Debug, Clone)]
pub struct UpdateEntryArgs {
    /// Namespace of the updated collection.
    pub namespace: String,
    /// The `_id` the update was matched on.
    pub criteria_id: SessionId,
    /// Whether the write originates from chunk migration.
    pub from_migrate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    #[test]
    fn test_dead_end_sentinel_shape() {
        assert!(is_dead_end_sentinel(&json!({ "$incompleteOplogHistory": 1 })));
        assert!(!is_dead_end_sentinel(&json!({ "$incompleteOplogHistory": 2 })));
        assert!(!is_dead_end_sentinel(&json!({})));
    }

    #[test]
    fn test_session_record_round_trip() {
        let record = SessionRecord {
            session_id: SessionId::new(),
            txn_num: 12,
            last_write_op_time: OpTime::new(Timestamp(40), 2),
            last_write_date: WallTime::from_millis(1_700_000_000_000),
        };
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: SessionRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_repl_operation_size_tracks_payload() {
        let small = ReplOperation::insert("db.coll", json!({"a": 1}));
        let big = ReplOperation::insert("db.coll", json!({"a": "x".repeat(1024)}));
        assert!(big.size_bytes() > small.size_bytes());
    }
}
