//! Durable session state: history loading and record persistence.
//!
//! Two concerns live here, both operating through the collaborator
//! seams in `vellum-core`: rebuilding a session's committed-statement
//! map from the oplog chain ([`history`]), and the replacement upsert
//! that advances the session's durable row ([`writer`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod history;
pub mod writer;

pub use history::{
    fetch_active_transaction_history, ActiveTransactionHistory, TransactionHistoryIterator,
};
pub use writer::{matching_transaction_table_update, update_session_entry};
