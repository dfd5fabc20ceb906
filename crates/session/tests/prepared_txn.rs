//! Two-phase (prepared) transaction participants.

use std::sync::Arc;
use vellum_core::context::{Client, OperationContext};
use vellum_core::error::Error;
use vellum_core::testing::{ObserverEvent, TestHarness};
use vellum_core::types::{SessionId, Timestamp};
use vellum_session::{Session, TxnStateKind};

fn checked_out(harness: &TestHarness) -> (Arc<Session>, Arc<Client>, OperationContext) {
    let client = harness.new_client("conn");
    let mut op_ctx = harness.new_operation(&client);
    let session = Session::new(SessionId::new(), Arc::clone(&harness.service));
    session.refresh_from_storage_if_needed(&mut op_ctx).unwrap();
    (session, client, op_ctx)
}

fn begin_and_unstash(session: &Arc<Session>, op_ctx: &mut OperationContext, txn_number: i64) {
    op_ctx.set_txn_number(txn_number);
    session
        .begin_or_continue_txn(op_ctx, txn_number, Some(false), Some(true), "test", "insert")
        .unwrap();
    session
        .unstash_transaction_resources(op_ctx, "insert")
        .unwrap();
}

#[test]
fn test_prepare_then_commit() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);

    let prepare_ts = session.prepare_transaction(&mut op_ctx).unwrap();
    assert!(!prepare_ts.is_null());
    assert_eq!(session.transaction_state(), TxnStateKind::Prepared);

    let commit_ts = Timestamp(prepare_ts.0 + 10);
    session
        .commit_prepared_transaction(&mut op_ctx, commit_ts)
        .unwrap();
    assert_eq!(session.transaction_state(), TxnStateKind::Committed);

    assert_eq!(
        harness.observer.events(),
        vec![
            ObserverEvent::Prepare,
            ObserverEvent::Commit { was_prepared: true }
        ]
    );

    let metrics = harness.service.transactions_metrics().snapshot();
    assert_eq!(metrics.total_committed, 1);
    assert_eq!(metrics.current_open, 0);
}

#[test]
fn test_unprepared_commit_rejected_on_prepared_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);
    session.prepare_transaction(&mut op_ctx).unwrap();

    let err = session.commit_unprepared_transaction(&mut op_ctx).unwrap_err();
    assert!(matches!(err, Error::InvalidOptions { .. }));
    // The transaction is still prepared and can be committed properly.
    assert_eq!(session.transaction_state(), TxnStateKind::Prepared);
}

#[test]
fn test_commit_timestamp_rejected_on_unprepared_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);
    let err = session
        .commit_prepared_transaction(&mut op_ctx, Timestamp(99))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions { .. }));
    assert_eq!(session.transaction_state(), TxnStateKind::InProgress);
}

#[test]
fn test_null_commit_timestamp_rejected() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);
    session.prepare_transaction(&mut op_ctx).unwrap();

    let err = session
        .commit_prepared_transaction(&mut op_ctx, Timestamp::null())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions { .. }));
}

#[test]
fn test_prepare_failure_aborts_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);
    harness.observer.fail_on_prepare(true);

    let err = session.prepare_transaction(&mut op_ctx).unwrap_err();
    assert!(matches!(err, Error::Internal { .. }));
    assert_eq!(session.transaction_state(), TxnStateKind::Aborted);
    assert!(!op_ctx.has_txn_write_unit_of_work());
}

#[test]
fn test_prepared_transaction_survives_stash_cycle() {
    let harness = TestHarness::new();
    let (session, client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);
    let prepare_ts = session.prepare_transaction(&mut op_ctx).unwrap();

    session.stash_transaction_resources(&mut op_ctx).unwrap();
    assert!(session.has_txn_resource_stash());

    let mut op_ctx2 = harness.new_operation(&client);
    op_ctx2.set_txn_number(7);
    session
        .unstash_transaction_resources(&mut op_ctx2, "commitTransaction")
        .unwrap();

    session
        .commit_prepared_transaction(&mut op_ctx2, Timestamp(prepare_ts.0 + 1))
        .unwrap();
    assert_eq!(session.transaction_state(), TxnStateKind::Committed);
}

#[test]
fn test_explicit_abort_ends_prepared_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_and_unstash(&session, &mut op_ctx, 7);
    session.prepare_transaction(&mut op_ctx).unwrap();

    session.abort_active_transaction(&mut op_ctx);
    assert_eq!(session.transaction_state(), TxnStateKind::Aborted);
}
