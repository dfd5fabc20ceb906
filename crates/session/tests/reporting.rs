//! CurOp-style transaction reports and the slow-transaction log line.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vellum_core::context::{Client, OperationContext, ReadConcernArgs, ReadConcernLevel};
use vellum_core::testing::TestHarness;
use vellum_core::traits::LockerInfo;
use vellum_core::types::SessionId;
use vellum_session::Session;

fn checked_out(harness: &TestHarness) -> (Arc<Session>, Arc<Client>, OperationContext) {
    let client = harness.new_client("conn");
    let mut op_ctx = harness.new_operation(&client);
    let session = Session::new(SessionId::new(), Arc::clone(&harness.service));
    session.refresh_from_storage_if_needed(&mut op_ctx).unwrap();
    (session, client, op_ctx)
}

fn begin_txn(session: &Arc<Session>, op_ctx: &mut OperationContext, txn_number: i64) {
    op_ctx.set_txn_number(txn_number);
    session
        .begin_or_continue_txn(op_ctx, txn_number, Some(false), Some(true), "test", "insert")
        .unwrap();
}

#[test]
fn test_stashed_report_shape() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 6);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    harness.clock.advance(Duration::from_millis(5));
    session.stash_transaction_resources(&mut op_ctx).unwrap();

    let report = session.report_stashed_state().unwrap();
    assert_eq!(report["desc"], json!("inactive transaction"));
    assert_eq!(report["active"], json!(false));
    assert_eq!(report["waitingForLock"], json!(false));
    assert_eq!(report["client"], json!("127.0.0.1:27017"));
    assert_eq!(report["appName"], json!("test-app"));
    assert_eq!(
        report["lsid"],
        serde_json::to_value(session.session_id()).unwrap()
    );
    assert_eq!(report["transaction"]["parameters"]["txnNumber"], json!(6));
    assert_eq!(report["transaction"]["parameters"]["autocommit"], json!(false));
    assert!(report["transaction"]["timeOpenMicros"].as_u64().unwrap() >= 5_000);
    assert!(report["locks"]["locks"].is_array());

    // While a stash exists, the unstashed report stays silent.
    assert!(session
        .report_unstashed_state(&ReadConcernArgs::default())
        .is_none());
}

#[test]
fn test_unstashed_report_for_retryable_write() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    op_ctx.set_txn_number(4);
    session
        .begin_or_continue_txn(&mut op_ctx, 4, None, None, "test", "insert")
        .unwrap();

    let report = session
        .report_unstashed_state(&ReadConcernArgs::default())
        .unwrap();
    let parameters = &report["transaction"]["parameters"];
    assert_eq!(parameters["txnNumber"], json!(4));
    // Retryable writes carry only the transaction number.
    assert!(parameters.get("autocommit").is_none());
    assert!(report["transaction"].get("timeOpenMicros").is_none());
}

#[test]
fn test_unstashed_report_for_open_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 6);
    session
        .unstash_transaction_resources(&mut op_ctx, "find")
        .unwrap();

    let read_concern = ReadConcernArgs::with_level(ReadConcernLevel::Snapshot);
    let report = session.report_unstashed_state(&read_concern).unwrap();
    let txn = &report["transaction"];
    assert_eq!(txn["parameters"]["autocommit"], json!(false));
    assert_eq!(txn["parameters"]["readConcern"]["level"], json!("snapshot"));
    assert!(txn.get("timeActiveMicros").is_some());
    assert!(txn.get("timeInactiveMicros").is_some());

    session.abort_active_transaction(&mut op_ctx);
}

#[test]
fn test_stashed_report_absent_without_stash() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    assert!(session.report_stashed_state().is_none());

    begin_txn(&session, &mut op_ctx, 6);
    assert!(session.report_stashed_state().is_none());
}

#[test]
fn test_slow_transaction_log_line_after_commit() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 6);
    session
        .unstash_transaction_resources(&mut op_ctx, "find")
        .unwrap();
    harness.clock.advance(Duration::from_millis(12));
    session.commit_unprepared_transaction(&mut op_ctx).unwrap();

    let line = session.transaction_info_for_log(&LockerInfo::default());
    assert!(line.contains("terminationCause:committed"), "{line}");
    assert!(line.contains("parameters:"), "{line}");
    assert!(line.contains("txnNumber"), "{line}");
    assert!(line.contains("timeActiveMicros:"), "{line}");
    assert!(line.contains("numYields:0"), "{line}");
    assert!(line.contains("locks:"), "{line}");
}

#[test]
fn test_slow_transaction_log_line_after_abort() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 6);
    session
        .unstash_transaction_resources(&mut op_ctx, "insert")
        .unwrap();
    session.abort_active_transaction(&mut op_ctx);

    let line = session.transaction_info_for_log(&LockerInfo::default());
    assert!(line.contains("terminationCause:aborted"), "{line}");
}

#[test]
#[should_panic(expected = "50771")]
fn test_log_line_requires_terminated_transaction() {
    let harness = TestHarness::new();
    let (session, _client, mut op_ctx) = checked_out(&harness);

    begin_txn(&session, &mut op_ctx, 6);
    let _ = session.transaction_info_for_log(&LockerInfo::default());
}
