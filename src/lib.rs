//! # Vellum
//!
//! The per-logical-session transaction controller of a replicated
//! document database server: retryable writes with at-most-once replay,
//! multi-statement interactive transactions with suspendable resources,
//! and two-phase (prepared) transaction participants.
//!
//! The [`Session`] object is the entry point. Command dispatch checks
//! one out per session id, calls [`Session::begin_or_continue_txn`],
//! stashes and unstashes transaction resources around network round
//! trips, and finishes with prepare, commit, or abort. Storage, lock
//! manager, replication, and op-observer collaborators are supplied
//! behind the traits in [`vellum_core::traits`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use vellumdb::{Session, SessionId};
//! use vellum_core::testing::TestHarness;
//!
//! let harness = TestHarness::new();
//! let client = harness.new_client("conn1");
//! let mut op_ctx = harness.new_operation(&client);
//!
//! let session = Session::new(SessionId::new(), Arc::clone(&harness.service));
//! session.refresh_from_storage_if_needed(&mut op_ctx)?;
//! session.begin_or_continue_txn(&mut op_ctx, 0, None, None, "test", "insert")?;
//! # Ok::<(), vellum_core::Error>(())
//! ```

pub use vellum_core::{
    Error, OpTime, Result, SessionId, StmtId, Timestamp, TxnNumber, WallTime,
};
pub use vellum_durability::{
    fetch_active_transaction_history, matching_transaction_table_update, update_session_entry,
};
pub use vellum_session::{Session, TxnStateKind};
