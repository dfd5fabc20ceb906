//! Core types and collaborator seams for the vellum session layer.
//!
//! This crate defines everything the session controller shares with its
//! neighbors: session and transaction identifiers, the durable record
//! shapes, the error model, execution-context plumbing, and the traits
//! behind which the storage engine, lock manager, replication stack,
//! and op-observer live. The [`testing`] module provides in-memory
//! implementations of every trait for the workspace's test suites.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod error;
pub mod failpoint;
pub mod limits;
pub mod metrics;
pub mod record;
pub mod testing;
pub mod traits;
pub mod types;

pub use config::{TransactionConfig, TransactionParameters};
pub use context::{
    with_write_unit_of_work, Client, OperationContext, ReadConcernArgs, ReadConcernLevel,
    RecoveryUnitState, ReleasedUnitOfWork, ServiceContext, WriteUnitOfWork,
};
pub use error::{fassert_on_repeated_execution, fatal, Error, Result};
pub use record::{
    is_dead_end_sentinel, CommandKind, OperationKind, OplogEntry, OplogEntryBody, ReplOperation,
    SessionRecord, UpdateEntryArgs, DEAD_END_SENTINEL, SESSION_RECORDS_COLLECTION,
};
pub use types::{
    OpTime, SessionId, StmtId, Timestamp, TxnNumber, WallTime, INCOMPLETE_HISTORY_STMT_ID,
    UNINITIALIZED_TXN_NUMBER,
};
