//! Multi-statement interactive transactions: resource stashing across
//! round trips, command policy, size bounds, and the commit path.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use vellum_core::context::{
    Client, OperationContext, ReadConcernArgs, ReadConcernLevel, ServiceContext,
};
use vellum_core::error::{Error, Result};
use vellum_core::limits::MAX_INTERNAL_DOCUMENT_SIZE;
use vellum_core::record::{OperationKind, ReplOperation};
use vellum_core::testing::{
    ManualClock, MemOplog, MemRecordStore, MemReplCoordinator, MemStorageEngine, TestHarness,
};
use vellum_core::traits::OpObserver;
use vellum_core::types::SessionId;
use vellum_session::{Session, SideTransactionBlock, TxnStateKind};

fn begin_txn(session: &Arc<Session>, op_ctx: &mut OperationContext, txn_number: i64) {
    op_ctx.set_txn_number(txn_number);
    session
        .begin_or_continue_txn(op_ctx, txn_number, Some(false), Some(true), "test", "insert")
        .unwrap();
}

fn checked_out(harness: &TestHarness) -> (Arc<Session>, Arc<Client>, OperationContext) {
    let client = harness.new_client("conn");
    let mut op_ctx = harness.new_operation(&client);
    let session = Session::new(SessionId::new(), Arc::clone(&harness.service));
    session.refresh_from_storage_if_needed(&mut op_ctx).unwrap();
    (session, client, op_ctx)
}

/// Observer that plays the real one's role on unprepared commit:
/// draining the operation buffer for oplog emission.
#[derive(Default)]
struct DrainingObserver {
    session: Mutex<Option<Arc<Session>>>,
    drained: Mutex<Vec<ReplOperation>>,
}

impl DrainingObserver {
    fn bind(&self, session: &Arc<Session>) {
        *self.session.lock() = Some(Arc::clone(session));
    }

    fn drained(&self) -> Vec<ReplOperation> {
        self.drained.lock().clone()
    }
}

impl OpObserver for DrainingObserver {
    fn on_transaction_prepare(&self, _op_ctx: &mut OperationContext) -> Result<()> {
        Ok(())
    }

    fn on_transaction_commit(
        &self,
        op_ctx: &mut OperationContext,
        was_prepared: bool,
    ) -> Result<()> {
        if was_prepared {
            return Ok(());
        }
        let session = self.session.lock().clone();
        if let Some(session) = session {
            let operations = session.end_transaction_and_retrieve_operations(op_ctx)?;
            self.drained.lock().extend(operations);
        }
        Ok(())
    }
}

struct DrainingSetup {
    service: Arc<ServiceContext>,
    observer: Arc<DrainingObserver>,
    clock: Arc<ManualClock>,
}

fn setup_with_draining_observer() -> DrainingSetup {
    let observer = Arc::new(DrainingObserver::default());
    let clock = ManualClock::new();
    let service = ServiceContext::new(
        MemStorageEngine::new(),
        observer.clone(),
        MemOplog::new(),
        MemRecordStore::new(),
        MemReplCoordinator::new(),
        clock.clone(),
    );
    DrainingSetup {
        service,
        observer,
        clock,
    }
}

#[test]
fn test_happy_path_multi_statement_commit() {
    let setup = setup_with_draining_observer();
    let client = Client::new("conn", "127.0.0.1:51001", 3, "app", json!({}));
    let mut op_ctx = OperationContext::new(&setup.service, &client);
    let session = Session::new(SessionId::new(), Arc::clone(&setup.service));
    setup.observer.bind(&session);
    session.refresh_from_storage_if_needed(&mut op_ctx).unwrap();

    begin_txn(&session, &mut op_ctx, 6);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    assert!(op_ctx.has_txn_write_unit_of_work());
    assert!(op_ctx.recovery_unit().read_timestamp().is_some());
    assert!(op_ctx.locker().is_locked());

    session
        .add_transaction_operation(
            &mut op_ctx,
            ReplOperation::insert("test.coll", json!({ "a": 1 })),
        )
        .unwrap();
    session.stash_transaction_resources(&mut op_ctx).unwrap();
    assert!(session.has_txn_resource_stash());
    assert!(!op_ctx.has_txn_write_unit_of_work());

    // The next round trip arrives on a fresh operation.
    setup.clock.advance(std::time::Duration::from_millis(20));
    let mut op_ctx2 = OperationContext::new(&setup.service, &client);
    op_ctx2.set_txn_number(6);
    session
        .begin_or_continue_txn(&mut op_ctx2, 6, Some(false), None, "admin", "commitTransaction")
        .unwrap();
    session
        .unstash_transaction_resources(&mut op_ctx2, "commitTransaction")
        .unwrap();
    assert!(!session.has_txn_resource_stash());

    session.commit_unprepared_transaction(&mut op_ctx2).unwrap();
    assert_eq!(session.transaction_state(), TxnStateKind::Committed);

    let drained = setup.observer.drained();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].kind, OperationKind::Insert);

    let metrics = setup.service.transactions_metrics().snapshot();
    assert_eq!(metrics.total_started, 1);
    assert_eq!(metrics.total_committed, 1);
    assert_eq!(metrics.current_open, 0);
    assert_eq!(metrics.current_active, 0);
    assert_eq!(metrics.current_inactive, 0);
}

#[test]
fn test_stash_then_unstash_is_identity() {
    let harness = TestHarness::new();
    let (session, client, mut op_ctx) = checked_out(&harness);

    op_ctx.set_read_concern(ReadConcernArgs::with_level(ReadConcernLevel::Snapshot));
    begin_txn(&session, &mut op_ctx, 11);
    session
        .unstash_transaction_resources(&mut op_ctx, "find")
        .unwrap();

    let read_timestamp = op_ctx.recovery_unit().read_timestamp();
    assert!(read_timestamp.is_some());
    assert!(op_ctx.locker().is_locked());

    session.stash_transaction_resources(&mut op_ctx).unwrap();

    let mut op_ctx2 = harness.new_operation(&client);
    op_ctx2.set_txn_number(11);
    session
        .unstash_transaction_resources(&mut op_ctx2, "find")
        .unwrap();

    // Same snapshot, same locks, same read concern as before the stash.
    assert_eq!(op_ctx2.recovery_unit().read_timestamp(), read_timestamp);
    assert!(op_ctx2.locker().is_locked());
    assert_eq!(
        op_ctx2.read_concern().level,
        Some(ReadConcernLevel::Snapshot)
    );
    assert!(op_ctx2.has_txn_write_unit_of_work());
}

#[test]
fn test_read_concern_rejected_on_continuation() {
    let harness = TestHarness::new();
    let (session, client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 11);
    session
        .unstash_transaction_resources(&mut op_ctx, "find")
        .unwrap();
    session.stash_transaction_resources(&mut op_ctx).unwrap();

    let mut op_ctx2 = harness.new_operation(&client);
    op_ctx2.set_txn_number(11);
    op_ctx2.set_read_concern(ReadConcernArgs::with_level(ReadConcernLevel::Majority));
    let err = session
        .unstash_transaction_resources(&mut op_ctx2, "find")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions { .. }));
}

#[test]
fn test_first_command_failure_aborts_on_continue() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 8);
    // The first command dies before reaching the stash.

    let err = session
        .begin_or_continue_txn(&mut op_ctx, 8, Some(false), None, "test", "insert")
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchTransaction { .. }));
    assert_eq!(session.transaction_state(), TxnStateKind::Aborted);
}

#[test]
fn test_unstash_after_abort_is_no_such_transaction() {
    let harness = TestHarness::new();
    let (session, client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 9);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    session.abort_active_transaction(&mut op_ctx);
    assert_eq!(session.transaction_state(), TxnStateKind::Aborted);

    // The abortTransaction command itself ends with a stash, which must
    // be a silent no-op on the aborted state.
    session.stash_transaction_resources(&mut op_ctx).unwrap();

    let mut op_ctx2 = harness.new_operation(&client);
    op_ctx2.set_txn_number(9);
    let err = session
        .unstash_transaction_resources(&mut op_ctx2, "insert")
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchTransaction { .. }));
}

#[test]
fn test_start_transaction_on_active_number_conflicts() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 7);
    let err = session
        .begin_or_continue_txn(&mut op_ctx, 7, Some(false), Some(true), "test", "insert")
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingOperationInProgress { .. }));
}

#[test]
fn test_continue_without_start_on_new_number() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    op_ctx.set_txn_number(7);
    let err = session
        .begin_or_continue_txn(&mut op_ctx, 7, Some(false), None, "test", "insert")
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchTransaction { .. }));
}

#[test]
fn test_command_policy() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);
    op_ctx.set_txn_number(3);

    let not_supported = |err: Error| {
        assert!(matches!(
            err,
            Error::OperationNotSupportedInTransaction { .. }
        ));
    };

    // count is rejected everywhere.
    not_supported(
        session
            .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "test", "count")
            .unwrap_err(),
    );
    // Commands outside the allowlist are rejected.
    not_supported(
        session
            .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "test", "shutdown")
            .unwrap_err(),
    );
    // config and local never host transactions.
    not_supported(
        session
            .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "config", "find")
            .unwrap_err(),
    );
    not_supported(
        session
            .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "local", "insert")
            .unwrap_err(),
    );
    // admin only hosts the transaction-control commands.
    not_supported(
        session
            .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "admin", "find")
            .unwrap_err(),
    );

    // dbHash needs test commands enabled.
    not_supported(
        session
            .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "test", "dbHash")
            .unwrap_err(),
    );
    harness.service.set_test_commands_enabled(true);
    session
        .begin_or_continue_txn(&mut op_ctx, 3, Some(false), Some(true), "test", "dbHash")
        .unwrap();
    assert_eq!(session.transaction_state(), TxnStateKind::InProgress);
}

#[test]
fn test_transaction_size_boundary() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    // `null` serializes to 4 bytes; the namespace pads to the cap.
    let op_of_size = |size: usize| ReplOperation {
        namespace: "x".repeat(size - 4),
        kind: OperationKind::Insert,
        document: json!(null),
    };

    begin_txn(&session, &mut op_ctx, 2);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    session
        .add_transaction_operation(&mut op_ctx, op_of_size(MAX_INTERNAL_DOCUMENT_SIZE))
        .unwrap();
    session.abort_active_transaction(&mut op_ctx);

    // One byte more fails.
    begin_txn(&session, &mut op_ctx, 3);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    let err = session
        .add_transaction_operation(&mut op_ctx, op_of_size(MAX_INTERNAL_DOCUMENT_SIZE + 1))
        .unwrap_err();
    assert!(matches!(err, Error::TransactionTooLarge { .. }));
}

#[test]
fn test_lock_timeout_on_first_unstash() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 4);
    harness.storage.contend_global_lock(true);
    let err = session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    harness.storage.contend_global_lock(false);

    // The session surfaces the timeout as a transaction abort.
    session.abort_active_transaction(&mut op_ctx);
    assert_eq!(session.transaction_state(), TxnStateKind::Aborted);
}

#[test]
fn test_commit_failure_aborts_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 5);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();

    harness.storage.fail_commits(true);
    let err = session.commit_unprepared_transaction(&mut op_ctx).unwrap_err();
    assert!(matches!(err, Error::Internal { .. }));
    harness.storage.fail_commits(false);

    assert_eq!(session.transaction_state(), TxnStateKind::Aborted);
    assert!(!op_ctx.has_txn_write_unit_of_work());
    let metrics = harness.service.transactions_metrics().snapshot();
    assert_eq!(metrics.total_aborted, 1);
    assert_eq!(metrics.current_open, 0);
}

#[test]
fn test_commit_advances_client_last_op_to_speculative_read() {
    let harness = TestHarness::new();
    let (session, client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 6);
    session
        .unstash_transaction_resources(&mut op_ctx, "find")
        .unwrap();
    session.set_speculative_transaction_op_time_to_last_applied(&mut op_ctx);
    let speculative = session.speculative_read_op_time();
    assert!(!speculative.is_null());

    session.commit_unprepared_transaction(&mut op_ctx).unwrap();
    assert_eq!(client.last_op(), speculative);
}

#[test]
fn test_side_transaction_block_swaps_transaction_out_and_back() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 12);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    let txn_read_timestamp = op_ctx.recovery_unit().read_timestamp();

    SideTransactionBlock::run(&mut op_ctx, |op_ctx| {
        // Inside the block the operation runs outside the user's
        // transaction: no write unit of work, fresh snapshot.
        assert!(!op_ctx.has_txn_write_unit_of_work());
        assert!(op_ctx.recovery_unit().read_timestamp().is_none());
        Ok(())
    })
    .unwrap();

    assert!(op_ctx.has_txn_write_unit_of_work());
    assert_eq!(op_ctx.recovery_unit().read_timestamp(), txn_read_timestamp);

    // A failing internal operation still restores the transaction.
    let err = SideTransactionBlock::run(&mut op_ctx, |_op_ctx| -> vellum_core::Result<()> {
        Err(Error::invalid_options("boom"))
    })
    .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions { .. }));
    assert!(op_ctx.has_txn_write_unit_of_work());

    session.abort_active_transaction(&mut op_ctx);
}

#[test]
fn test_new_txn_number_aborts_in_progress_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 7);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    session.stash_transaction_resources(&mut op_ctx).unwrap();
    assert!(session.has_txn_resource_stash());

    begin_txn(&session, &mut op_ctx, 8);
    assert_eq!(session.active_txn_number(), 8);
    assert_eq!(session.transaction_state(), TxnStateKind::InProgress);
    assert!(!session.has_txn_resource_stash());

    let metrics = harness.service.transactions_metrics().snapshot();
    assert_eq!(metrics.total_aborted, 1);
    assert_eq!(metrics.total_started, 2);
}
