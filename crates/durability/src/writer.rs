//! Replacement upsert of a session's durable record.
//!
//! The session-records collection is keyed by session id with `_id` as
//! its sole index, so an in-place replacement needs no index
//! maintenance. Both racing shapes surface as a write conflict so the
//! caller retries under a new snapshot, preserving at-most-once
//! semantics: an insert that loses to a concurrent insert, and an
//! update whose target document changed under the starting snapshot.

use std::sync::Arc;
use vellum_core::context::{with_write_unit_of_work, OperationContext};
use vellum_core::error::{fatal, Error, Result};
use vellum_core::record::{
    OperationKind, OplogEntry, OplogEntryBody, ReplOperation, SessionRecord, UpdateEntryArgs,
    SESSION_RECORDS_COLLECTION,
};
use vellum_core::traits::LockMode;

/// Durably upsert `record` as the session's row.
///
/// Runs inside its own write unit of work under an intent-exclusive
/// lock. A missing session-records collection or `_id` index is an
/// unrecoverable deployment error and terminates the process.
///
/// # Errors
///
/// [`Error::WriteConflict`] when the row mutated (or appeared) under
/// this operation's snapshot; the caller must retry with fresh state.
pub fn update_session_entry(op_ctx: &mut OperationContext, record: SessionRecord) -> Result<()> {
    let service = Arc::clone(op_ctx.service());
    let records = service.record_store();

    if !records.collection_exists() {
        fatal(
            40527,
            &format!(
                "unable to persist transaction state because the {SESSION_RECORDS_COLLECTION} \
                 collection is missing; it may have been manually deleted"
            ),
        );
    }

    op_ctx.locker_mut().lock_global(LockMode::IntentExclusive)?;
    let result = with_write_unit_of_work(op_ctx, |op_ctx| {
        if !records.id_index_exists() {
            fatal(
                40672,
                &format!("failed to fetch _id index for {SESSION_RECORDS_COLLECTION}"),
            );
        }

        let _starting_snapshot = op_ctx.recovery_unit().snapshot_id();

        match records.find_id(&record.session_id) {
            None => match records.insert(record.clone()) {
                Err(err) if err.is_duplicate_key() => Err(Error::write_conflict(format!(
                    "session record for {} appeared concurrently",
                    record.session_id
                ))),
                other => other,
            },
            Some(record_id) => {
                let (original, version) = records.read(&record_id)?;
                if original.session_id != record.session_id {
                    // The row no longer matches the lookup criteria.
                    return Err(Error::write_conflict(format!(
                        "session record for {} changed under snapshot",
                        record.session_id
                    )));
                }
                let args = UpdateEntryArgs {
                    namespace: SESSION_RECORDS_COLLECTION.to_string(),
                    criteria_id: record.session_id,
                    from_migrate: false,
                };
                records.update(&record_id, version, record.clone(), &args)
            }
        }
    });
    op_ctx.locker_mut().unlock_global();
    result
}

/// Build the session-records update entry that mirrors `entry`, for
/// secondaries applying a retryable write's oplog entry. Returns `None`
/// when the entry carries no transaction number.
pub fn matching_transaction_table_update(entry: &OplogEntry) -> Option<OplogEntry> {
    let txn_number = entry.txn_number?;

    let new_record = SessionRecord {
        session_id: entry.session_id,
        txn_num: txn_number,
        last_write_op_time: entry.op_time,
        last_write_date: entry.wall_clock_time,
    };

    Some(OplogEntry {
        op_time: entry.op_time,
        prev_op_time: None,
        session_id: entry.session_id,
        txn_number: Some(txn_number),
        stmt_id: None,
        wall_clock_time: entry.wall_clock_time,
        body: OplogEntryBody::Write(ReplOperation {
            namespace: SESSION_RECORDS_COLLECTION.to_string(),
            kind: OperationKind::Update,
            document: serde_json::json!({
                "_id": new_record.session_id,
                "txnNum": new_record.txn_num,
                "lastWriteOpTime": new_record.last_write_op_time,
                "lastWriteDate": new_record.last_write_date,
            }),
        }),
        object2: Some(serde_json::json!({ "_id": new_record.session_id })),
    })
}
