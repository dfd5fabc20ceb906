//! The session core.
//!
//! One [`Session`] per logical session id: a concurrent state machine
//! owning the authoritative in-memory view of that session's active
//! transaction. It serializes retryable single-statement writes,
//! multi-statement transactions, and two-phase (prepared) participants
//! on a single mutex, coordinates stashing of storage and lock
//! resources across network round trips, and enforces at-most-once
//! statement execution against the durable session-records row.
//!
//! Concurrency discipline: the mutex is never held across I/O. Any
//! operation that must touch storage, the op-observer, or lock
//! acquisition releases the mutex first and re-verifies the active
//! transaction number and state after reacquiring. `invalidate`,
//! `abort_arbitrary_transaction[_if_expired]`, and the post-commit
//! cache hook run without a session checkout and may interleave with
//! everything else.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vellum_core::context::{
    OperationContext, ReadConcernArgs, ReadConcernLevel, RecoveryUnitState, ServiceContext,
};
use vellum_core::error::{fassert_on_repeated_execution, fatal, Error, Result};
use vellum_core::limits::MAX_INTERNAL_DOCUMENT_SIZE;
use vellum_core::record::{OplogEntry, ReplOperation, SessionRecord};
use vellum_core::traits::{LockMode, LockerInfo, ReadSource};
use vellum_core::types::{
    OpTime, SessionId, StmtId, Timestamp, TxnNumber, WallTime, INCOMPLETE_HISTORY_STMT_ID,
    UNINITIALIZED_TXN_NUMBER,
};
use vellum_durability::history::{fetch_active_transaction_history, TransactionHistoryIterator};
use vellum_durability::writer::update_session_entry;

use crate::resources::TxnResources;
use crate::state::{TransitionValidation, TxnState, TxnStateKind};
use crate::stats::{AdditiveMetrics, SingleTransactionStats};

/// Commands allowed in a multi-statement transaction on any database.
const TXN_CMD_ALLOWLIST: &[&str] = &[
    "abortTransaction",
    "aggregate",
    "commitTransaction",
    "coordinateCommitTransaction",
    "delete",
    "distinct",
    "doTxn",
    "find",
    "findandmodify",
    "findAndModify",
    "geoSearch",
    "getMore",
    "insert",
    "killCursors",
    "prepareTransaction",
    "update",
];

/// Commands additionally allowed when test commands are enabled.
const TXN_CMD_ALLOWLIST_TESTING: &[&str] = &["dbHash"];

/// Commands allowed on the `admin` database in a transaction.
const TXN_ADMIN_COMMANDS: &[&str] = &[
    "abortTransaction",
    "commitTransaction",
    "coordinateCommitTransaction",
    "doTxn",
    "prepareTransaction",
];

fn command_allowed_in_txn(cmd_name: &str, test_commands_enabled: bool) -> bool {
    TXN_CMD_ALLOWLIST.contains(&cmd_name)
        || (test_commands_enabled && TXN_CMD_ALLOWLIST_TESTING.contains(&cmd_name))
}

/// All mutable session state, guarded by the session mutex.
struct SessionInner {
    is_valid: bool,
    num_invalidations: u64,
    last_written_record: Option<SessionRecord>,
    active_txn_number: TxnNumber,
    committed_statements: HashMap<StmtId, OpTime>,
    has_incomplete_history: bool,
    txn_state: TxnState,
    autocommit: bool,
    speculative_read_op_time: OpTime,
    txn_resource_stash: Option<TxnResources>,
    transaction_operations: Vec<ReplOperation>,
    transaction_operation_bytes: usize,
    transaction_expire_date: Option<WallTime>,
    stats: Option<SingleTransactionStats>,
}

impl SessionInner {
    fn new() -> Self {
        SessionInner {
            is_valid: false,
            num_invalidations: 0,
            last_written_record: None,
            active_txn_number: UNINITIALIZED_TXN_NUMBER,
            committed_statements: HashMap::new(),
            has_incomplete_history: false,
            txn_state: TxnState::new(),
            autocommit: true,
            speculative_read_op_time: OpTime::null(),
            txn_resource_stash: None,
            transaction_operations: Vec::new(),
            transaction_operation_bytes: 0,
            transaction_expire_date: None,
            stats: None,
        }
    }
}

/// The per-session transaction controller.
pub struct Session {
    session_id: SessionId,
    service: Arc<ServiceContext>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Create the session object for `session_id`. State starts
    /// invalid; the first checkout refreshes it from storage.
    pub fn new(session_id: SessionId, service: Arc<ServiceContext>) -> Arc<Self> {
        Arc::new(Session {
            session_id,
            service,
            inner: Mutex::new(SessionInner::new()),
        })
    }

    /// This session's id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The highest transaction number this session has observed.
    pub fn active_txn_number(&self) -> TxnNumber {
        self.inner.lock().active_txn_number
    }

    /// The current transaction state.
    pub fn transaction_state(&self) -> TxnStateKind {
        self.inner.lock().txn_state.kind()
    }

    /// Whether the session is inside an open multi-statement
    /// transaction.
    pub fn in_multi_document_transaction(&self) -> bool {
        self.inner.lock().txn_state.in_multi_document_transaction()
    }

    /// Whether suspended transaction resources are parked on the
    /// session.
    pub fn has_txn_resource_stash(&self) -> bool {
        self.inner.lock().txn_resource_stash.is_some()
    }

    /// The read optime snapshotted at the transaction's first
    /// operation.
    pub fn speculative_read_op_time(&self) -> OpTime {
        self.inner.lock().speculative_read_op_time
    }

    // =========================================================================
    // Refresh and invalidation
    // =========================================================================

    /// Bring the in-memory state in line with the durable record, if an
    /// invalidation (or fresh creation) left it stale.
    ///
    /// The load runs without the mutex; the invalidation counter
    /// detects a racing `invalidate`, in which case the load is simply
    /// retried. Requires no locks held and local read concern.
    ///
    /// # Errors
    ///
    /// Durable read failures.
    pub fn refresh_from_storage_if_needed(&self, op_ctx: &mut OperationContext) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            return Ok(());
        }
        if op_ctx.locker().is_locked() {
            fatal(50744, "session refresh must not hold locks");
        }
        if op_ctx.read_concern().effective_level() != ReadConcernLevel::Local {
            fatal(50745, "session refresh requires local read concern");
        }

        let mut inner = self.inner.lock();
        while !inner.is_valid {
            let invalidations = inner.num_invalidations;
            drop(inner);

            let history = fetch_active_transaction_history(
                self.service.record_store(),
                self.service.oplog(),
                &self.session_id,
            )?;

            inner = self.inner.lock();
            if !inner.is_valid && inner.num_invalidations == invalidations {
                inner.is_valid = true;
                inner.last_written_record = history.last_record;

                let record_txn_num = inner.last_written_record.as_ref().map(|r| r.txn_num);
                if let Some(txn_num) = record_txn_num {
                    inner.active_txn_number = txn_num;
                    inner.committed_statements = history.committed_statements;
                    inner.has_incomplete_history = history.has_incomplete_history;
                    if history.transaction_committed {
                        // Refresh only observes the terminal applyOps
                        // entry, so the transition skips intermediate
                        // states; relaxed mode keeps the table clean
                        // for every other caller.
                        inner
                            .txn_state
                            .transition_to(TxnStateKind::Committed, TransitionValidation::Relaxed);
                    }
                }

                tracing::debug!(
                    session_id = %self.session_id,
                    active_txn_number = inner.active_txn_number,
                    statements = inner.committed_statements.len(),
                    "refreshed session state from storage"
                );
                break;
            }
        }
        Ok(())
    }

    /// Mark the in-memory state stale and drop the transaction cache.
    /// The next checkout refreshes from storage.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.is_valid = false;
        inner.num_invalidations += 1;

        inner.last_written_record = None;
        inner.active_txn_number = UNINITIALIZED_TXN_NUMBER;
        inner.committed_statements.clear();
        inner.speculative_read_op_time = OpTime::null();
        inner.has_incomplete_history = false;
    }

    // =========================================================================
    // Begin / continue
    // =========================================================================

    /// Enter the state machine for `txn_number`: continue the active
    /// transaction or retryable write, or start a new one.
    ///
    /// # Errors
    ///
    /// Command-policy rejections
    /// ([`Error::OperationNotSupportedInTransaction`]), stale numbers
    /// ([`Error::TransactionTooOld`]), option misuse
    /// ([`Error::InvalidOptions`],
    /// [`Error::ConflictingOperationInProgress`]), and
    /// [`Error::NoSuchTransaction`] when continuing a transaction that
    /// is not there (including the implicit abort of a transaction
    /// whose first command failed before stashing).
    pub fn begin_or_continue_txn(
        &self,
        op_ctx: &mut OperationContext,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
        start_transaction: Option<bool>,
        db_name: &str,
        cmd_name: &str,
    ) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            return Ok(());
        }
        if op_ctx.locker().is_locked() {
            fatal(50746, "transaction begin must not hold locks");
        }

        if autocommit.is_some() {
            if cmd_name == "count" {
                return Err(Error::not_supported_in_transaction(
                    "cannot run 'count' in a multi-statement transaction",
                ));
            }
            if !command_allowed_in_txn(cmd_name, self.service.test_commands_enabled()) {
                return Err(Error::not_supported_in_transaction(format!(
                    "cannot run '{cmd_name}' in a multi-statement transaction"
                )));
            }
            let admin_forbidden = db_name == "admin" && !TXN_ADMIN_COMMANDS.contains(&cmd_name);
            if db_name == "config" || db_name == "local" || admin_forbidden {
                return Err(Error::not_supported_in_transaction(format!(
                    "cannot run command against the '{db_name}' database in a transaction"
                )));
            }
        }

        let mut inner = self.inner.lock();
        self.begin_or_continue_locked(&mut inner, txn_number, autocommit, start_transaction)
    }

    /// The new-transaction-number path without command policy and
    /// without multi-statement state, for chunk migration copying
    /// history into a possibly stale session.
    ///
    /// # Errors
    ///
    /// [`Error::TransactionTooOld`] and
    /// [`Error::ConflictingOperationInProgress`].
    pub fn begin_or_continue_txn_on_migration(
        &self,
        op_ctx: &mut OperationContext,
        txn_number: TxnNumber,
    ) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            fatal(50757, "migration must not run on a direct client");
        }
        if op_ctx.locker().is_locked() {
            fatal(50758, "migration begin must not hold locks");
        }

        let mut inner = self.inner.lock();
        self.check_valid(&inner)?;
        self.check_txn_valid(&inner, txn_number)?;

        if txn_number == inner.active_txn_number {
            return Ok(());
        }
        self.set_active_txn_locked(&mut inner, txn_number);
        Ok(())
    }

    fn begin_or_continue_locked(
        &self,
        inner: &mut SessionInner,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
        start_transaction: Option<bool>,
    ) -> Result<()> {
        self.check_valid(inner)?;
        self.check_txn_valid(inner, txn_number)?;

        //
        // Continue the active transaction or retryable write.
        //
        if txn_number == inner.active_txn_number {
            if start_transaction.is_some() {
                return Err(Error::conflicting_operation(format!(
                    "cannot specify 'start_transaction' on transaction {txn_number} since it is \
                     already in progress"
                )));
            }

            if inner.txn_state.is_none() {
                if autocommit.is_some() {
                    return Err(Error::invalid_options(
                        "cannot specify 'autocommit' on an operation not inside a multi-statement \
                         transaction",
                    ));
                }
                return Ok(());
            }

            if !inner.autocommit {
                if autocommit != Some(false) {
                    return Err(Error::invalid_options(
                        "must specify autocommit=false on all operations of a multi-statement \
                         transaction",
                    ));
                }
                if inner.txn_state.is_in_progress() && inner.txn_resource_stash.is_none() {
                    // The first command of the transaction failed
                    // without aborting it. The read concern from that
                    // statement was never saved, so continuing is not
                    // safe.
                    tracing::warn!(
                        session_id = %self.session_id,
                        txn_number,
                        "aborting transaction whose first command failed before stashing"
                    );
                    self.abort_transaction_locked(inner);
                    return Err(Error::transaction_aborted(txn_number));
                }
            }
            return Ok(());
        }

        //
        // Start a new transaction or retryable write; the number is
        // strictly greater than the active one here.
        //
        match autocommit {
            Some(false) => {
                if start_transaction.is_none() {
                    return Err(Error::no_such_transaction(format!(
                        "given transaction number {txn_number} does not match any in-progress \
                         transactions"
                    )));
                }
                self.set_active_txn_locked(inner, txn_number);
                inner.autocommit = false;
                inner
                    .txn_state
                    .transition_to(TxnStateKind::InProgress, TransitionValidation::Validate);

                let now_micros = self.service.clock().now_micros();
                inner.stats = Some(SingleTransactionStats::start(now_micros));
                let lifetime_secs = self
                    .service
                    .parameters()
                    .transaction_lifetime_limit_seconds();
                inner.transaction_expire_date =
                    Some(self.service.clock().now() + Duration::from_secs(lifetime_secs as u64));

                let metrics = self.service.transactions_metrics();
                metrics.increment_total_started();
                metrics.increment_current_open();
            }
            Some(true) => {
                return Err(Error::invalid_options(
                    "autocommit must be false on a multi-statement transaction",
                ));
            }
            None => {
                if start_transaction.is_some() {
                    return Err(Error::invalid_options(
                        "'start_transaction' requires autocommit=false",
                    ));
                }
                // A retryable write.
                self.set_active_txn_locked(inner, txn_number);
                inner.autocommit = true;
            }
        }

        if !inner.transaction_operations.is_empty() {
            fatal(50748, "operation buffer must be empty when a transaction starts");
        }
        Ok(())
    }

    // =========================================================================
    // Retryable writes
    // =========================================================================

    /// Record that the statements in `stmt_ids` durably completed at
    /// `last_stmt_op_time`: upserts the session's durable row (as an
    /// unreplicated write; replication rides the caller's oplog entry)
    /// and schedules the in-memory cache update for when the caller's
    /// write unit of work commits.
    ///
    /// A statement id that already committed is data corruption and
    /// terminates the process.
    ///
    /// # Errors
    ///
    /// [`Error::WriteConflict`] from the durable upsert, validity and
    /// active-transaction violations, and failpoint-injected errors.
    pub fn on_write_op_completed_on_primary(
        self: &Arc<Self>,
        op_ctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_op_time: OpTime,
        last_stmt_write_date: WallTime,
    ) -> Result<()> {
        if !op_ctx.in_write_unit_of_work() {
            fatal(50755, "retryable write completion requires a write unit of work");
        }

        let record = {
            let inner = self.inner.lock();
            for stmt_id in &stmt_ids {
                if let Some(existing) =
                    self.check_statement_executed_locked(&inner, txn_number, *stmt_id)?
                {
                    fassert_on_repeated_execution(
                        &self.session_id,
                        txn_number,
                        *stmt_id,
                        existing,
                        last_stmt_op_time,
                    );
                }
            }
            self.make_session_record(txn_number, last_stmt_op_time, last_stmt_write_date)
        };

        update_session_entry(op_ctx, record)?;
        self.register_update_cache_on_commit(op_ctx, txn_number, stmt_ids, last_stmt_op_time)
    }

    /// Begin (or continue) `txn_number` for an incoming migration and
    /// decide whether `stmt_id` still needs to be copied. Returns
    /// `false` when the statement already executed, or when the
    /// recipient's history is truncated and the donor is sending the
    /// dead-end sentinel.
    ///
    /// # Errors
    ///
    /// Propagates everything except history truncation, which resolves
    /// to a copy decision instead.
    pub fn on_migrate_begin_on_primary(
        &self,
        op_ctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<bool> {
        self.begin_or_continue_txn_on_migration(op_ctx, txn_number)?;

        let inner = self.inner.lock();
        match self.check_statement_executed_locked(&inner, txn_number, stmt_id) {
            Ok(Some(_)) => Ok(false),
            Ok(None) => Ok(true),
            Err(err) if err.is_incomplete_history() => {
                // Truncated on the recipient; most likely an old local
                // chain for a session that is recent on the donor. Keep
                // copying to pick up the donor's full history.
                Ok(stmt_id != INCOMPLETE_HISTORY_STMT_ID)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`Session::on_write_op_completed_on_primary`], for a
    /// completed migration copy. The last-write date never moves
    /// backwards: the session's populated date wins over the migrated
    /// oplog's date.
    ///
    /// # Errors
    ///
    /// As [`Session::on_write_op_completed_on_primary`].
    pub fn on_migrate_completed_on_primary(
        self: &Arc<Self>,
        op_ctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_op_time: OpTime,
        oplog_last_write_date: WallTime,
    ) -> Result<()> {
        if !op_ctx.in_write_unit_of_work() {
            fatal(50759, "migration completion requires a write unit of work");
        }

        let record = {
            let inner = self.inner.lock();
            self.check_valid(&inner)?;
            self.check_is_active_transaction(&inner, txn_number, false)?;

            let txn_last_write_date = self.last_write_date_locked(&inner, txn_number)?;
            let updated_date = std::cmp::max(txn_last_write_date, oplog_last_write_date);
            self.make_session_record(txn_number, last_stmt_op_time, updated_date)
        };

        update_session_entry(op_ctx, record)?;
        self.register_update_cache_on_commit(op_ctx, txn_number, stmt_ids, last_stmt_op_time)
    }

    /// The optime of the session's last durable write under
    /// `txn_number`, or the null optime when the durable row belongs to
    /// another transaction.
    ///
    /// # Errors
    ///
    /// Validity and active-transaction violations.
    pub fn last_write_op_time(&self, txn_number: TxnNumber) -> Result<OpTime> {
        let inner = self.inner.lock();
        self.check_valid(&inner)?;
        self.check_is_active_transaction(&inner, txn_number, false)?;

        Ok(inner
            .last_written_record
            .as_ref()
            .filter(|record| record.txn_num == txn_number)
            .map(|record| record.last_write_op_time)
            .unwrap_or_default())
    }

    /// Whether `stmt_id` already executed under `txn_number`, returning
    /// the exact oplog entry of that execution.
    ///
    /// # Errors
    ///
    /// [`Error::IncompleteTransactionHistory`] when the map lacks the
    /// id but the chain is truncated; validity violations; oplog read
    /// failures during the fetch walk.
    pub fn check_statement_executed(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<OplogEntry>> {
        let stmt_op_time = {
            let inner = self.inner.lock();
            self.check_statement_executed_locked(&inner, txn_number, stmt_id)?
        };
        let op_time = match stmt_op_time {
            Some(op_time) => op_time,
            None => return Ok(None),
        };

        let mut iter = TransactionHistoryIterator::new(self.service.oplog(), op_time);
        while iter.has_next() {
            let entry = iter.next_entry()?;
            if entry.stmt_id == Some(stmt_id) {
                return Ok(Some(entry));
            }
        }
        fatal(50760, "committed statement missing from the oplog chain");
    }

    /// Whether `stmt_id` already executed under `txn_number`, without
    /// fetching the oplog entry.
    ///
    /// # Errors
    ///
    /// As [`Session::check_statement_executed`], minus fetch failures.
    pub fn check_statement_executed_no_oplog_entry_fetch(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(self
            .check_statement_executed_locked(&inner, txn_number, stmt_id)?
            .is_some())
    }

    // =========================================================================
    // Stash / unstash
    // =========================================================================

    /// Suspend the operation's transaction resources into the session's
    /// stash slot between network round trips. A no-op outside a
    /// multi-statement transaction (including after an abort, since the
    /// abortTransaction command itself ends with a stash).
    ///
    /// # Errors
    ///
    /// Active-transaction violations.
    pub fn stash_transaction_resources(&self, op_ctx: &mut OperationContext) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            return Ok(());
        }
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50749, "stash requires a transaction number on the operation"),
        };

        // Client lock before session mutex: the locker on the operation
        // is about to move, and a watcher may hold the client lock
        // while reading it.
        let client = Arc::clone(op_ctx.client());
        let _client_guard = client.lock();
        let mut inner = self.inner.lock();

        // The active number can be changed by migration, which does not
        // check out the session.
        self.check_is_active_transaction(&inner, txn_number, false)?;

        if !inner.txn_state.in_multi_document_transaction() {
            return Ok(());
        }

        let now_micros = self.service.clock().now_micros();
        if let Some(stats) = inner.stats.as_mut() {
            if stats.is_active() {
                stats.set_inactive(now_micros);
            }
        }

        if inner.txn_resource_stash.is_some() {
            fatal(50750, "transaction resources are already stashed");
        }
        inner.txn_resource_stash = Some(TxnResources::stash(op_ctx));

        let metrics = self.service.transactions_metrics();
        metrics.decrement_current_active();
        metrics.increment_current_inactive();

        if let Some(stats) = inner.stats.as_mut() {
            stats.update_last_client_info(op_ctx.client());
        }
        Ok(())
    }

    /// Attach the session's transaction to the operation: re-attach
    /// stashed resources, or, on the first command of a transaction,
    /// install a fresh write unit of work, cap lock requests, and fix
    /// the read snapshot under a global intent-exclusive lock.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchTransaction`] on an aborted transaction,
    /// [`Error::TransactionCommitted`] on a committed one (unless the
    /// command is the commit retry), [`Error::InvalidOptions`] when a
    /// continuation sends a read concern, lock timeouts, and
    /// active-transaction violations.
    pub fn unstash_transaction_resources(
        &self,
        op_ctx: &mut OperationContext,
        cmd_name: &str,
    ) -> Result<()> {
        if op_ctx.client().is_in_direct_client() {
            return Ok(());
        }
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50751, "unstash requires a transaction number on the operation"),
        };

        {
            let client = Arc::clone(op_ctx.client());
            let _client_guard = client.lock();
            let mut inner = self.inner.lock();

            // Kill and migration mutate these without a checkout.
            self.check_is_active_transaction(&inner, txn_number, false)?;

            if inner.txn_state.is_none() {
                // Retryable-write path: nothing to unstash.
                if inner.txn_resource_stash.is_some() {
                    fatal(50752, "retryable write with stashed transaction resources");
                }
                return Ok(());
            }

            if inner.txn_state.is_aborted() {
                // This is the entry point of transaction execution, so
                // the caller sees NoSuchTransaction rather than a
                // bare aborted error.
                return Err(Error::transaction_aborted(txn_number));
            }

            if inner.txn_state.is_committed() && cmd_name != "commitTransaction" {
                return Err(Error::TransactionCommitted { txn_number });
            }

            if inner.txn_resource_stash.is_some() {
                if !op_ctx.read_concern().is_empty() {
                    return Err(Error::invalid_options(
                        "only the first command in a transaction may specify a read concern",
                    ));
                }
                let resources = match inner.txn_resource_stash.take() {
                    Some(resources) => resources,
                    None => fatal(50784, "stash slot emptied concurrently"),
                };
                resources.release(op_ctx)?;

                let now_micros = self.service.clock().now_micros();
                if inner.txn_state.is_in_progress() {
                    if let Some(stats) = inner.stats.as_mut() {
                        stats.set_active(now_micros);
                    }
                }
                let metrics = self.service.transactions_metrics();
                metrics.increment_current_active();
                metrics.decrement_current_inactive();
                return Ok(());
            }

            // No stash: a prepared transaction always has one.
            if inner.txn_state.is_prepared() {
                fatal(50753, "prepared transaction has no stashed resources");
            }
            if !inner.txn_state.is_in_progress() {
                // Committed with a commitTransaction retry, or already
                // mid-commit: nothing more to do.
                return Ok(());
            }

            // First command of the transaction: fresh resources.
            op_ctx.begin_txn_write_unit_of_work();
            self.service.transactions_metrics().increment_current_active();

            let now_micros = self.service.clock().now_micros();
            if let Some(stats) = inner.stats.as_mut() {
                stats.set_active(now_micros);
            }

            // Bound every lock request so this transaction cannot stall
            // unrelated metadata operations.
            let max_lock_millis = self
                .service
                .parameters()
                .max_transaction_lock_request_timeout_millis();
            if max_lock_millis >= 0 {
                op_ctx
                    .locker_mut()
                    .set_max_lock_timeout(Duration::from_millis(max_lock_millis as u64));
            }
        }

        // Fix the read timestamp now rather than at the first lazy
        // storage access. Intent exclusive, not intent shared: this
        // transaction may write, and upgrading IS to IX is not
        // deadlock-safe. The unlock is deferred until the write unit of
        // work ends, so the lock protects the whole transaction.
        op_ctx.locker_mut().lock_global(LockMode::IntentExclusive)?;
        op_ctx.locker_mut().unlock_global();
        op_ctx.recovery_unit_mut().preallocate_snapshot();

        // The client lock must not be held here; the pause would block
        // currentOp.
        self.service
            .failpoints()
            .hang_after_preallocate_snapshot
            .pause_while_set();
        Ok(())
    }

    /// Snapshot the replication subsystem's last-applied position as
    /// the transaction's read optime.
    pub fn set_speculative_transaction_op_time_to_last_applied(
        &self,
        op_ctx: &mut OperationContext,
    ) {
        let mut inner = self.inner.lock();
        op_ctx
            .recovery_unit_mut()
            .set_timestamp_read_source(ReadSource::LastApplied);
        op_ctx.recovery_unit_mut().preallocate_snapshot();
        let read_timestamp = match op_ctx.recovery_unit().read_timestamp() {
            Some(read_timestamp) => read_timestamp,
            None => fatal(50754, "snapshot preallocation did not fix a read timestamp"),
        };
        // Transactions do not survive term changes, so pairing the
        // storage timestamp with the current term is race-free.
        inner.speculative_read_op_time =
            OpTime::new(read_timestamp, self.service.repl_coordinator().term());
    }

    // =========================================================================
    // Prepare / commit / abort
    // =========================================================================

    /// Durably prepare the active transaction, returning the prepare
    /// timestamp. Any failure on the way aborts the transaction.
    ///
    /// # Errors
    ///
    /// Observer or storage failures, and active-transaction violations;
    /// all of them leave the transaction aborted.
    pub fn prepare_transaction(&self, op_ctx: &mut OperationContext) -> Result<Timestamp> {
        let result = self.prepare_transaction_guarded(op_ctx);
        if result.is_err() {
            // Abort guard: dismissed only by a fully successful
            // prepare.
            self.abort_active_transaction(op_ctx);
        }
        result
    }

    fn prepare_transaction_guarded(&self, op_ctx: &mut OperationContext) -> Result<Timestamp> {
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50785, "prepare requires a transaction number on the operation"),
        };

        {
            let mut inner = self.inner.lock();
            self.check_is_active_transaction(&inner, txn_number, true)?;
            inner
                .txn_state
                .transition_to(TxnStateKind::Prepared, TransitionValidation::Validate);
        }

        // The observer writes the prepare oplog entry, which round
        // trips back into this session; the mutex must be free.
        let observer = self.service.op_observer();
        observer.on_transaction_prepare(op_ctx)?;

        {
            let inner = self.inner.lock();
            self.check_is_active_transaction(&inner, txn_number, true)?;
            if !inner.txn_state.is_prepared() {
                fatal(
                    50767,
                    &format!("current state: {}", inner.txn_state.kind()),
                );
            }
        }

        op_ctx.prepare_txn_write_unit_of_work()
    }

    /// Commit a transaction that was never prepared.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOptions`] on a prepared transaction, observer
    /// and storage failures, and active-transaction violations.
    pub fn commit_unprepared_transaction(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50787, "commit requires a transaction number on the operation"),
        };

        {
            let mut inner = self.inner.lock();
            if inner.txn_state.is_prepared() {
                return Err(Error::invalid_options(
                    "commit must provide a commit timestamp to a prepared transaction",
                ));
            }
            self.check_is_active_transaction(&inner, txn_number, true)?;
            inner.txn_state.transition_to(
                TxnStateKind::CommittingWithoutPrepare,
                TransitionValidation::Validate,
            );
        }

        let observer = self.service.op_observer();
        observer.on_transaction_commit(op_ctx, false)?;

        {
            let inner = self.inner.lock();
            self.check_is_active_transaction(&inner, txn_number, true)?;
        }

        self.commit_transaction_storage(op_ctx)
    }

    /// Commit a prepared transaction at the cluster-chosen
    /// `commit_timestamp`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOptions`] when the transaction is not prepared
    /// or the timestamp is null, observer and storage failures, and
    /// active-transaction violations.
    pub fn commit_prepared_transaction(
        &self,
        op_ctx: &mut OperationContext,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50788, "commit requires a transaction number on the operation"),
        };

        {
            let mut inner = self.inner.lock();
            if !inner.txn_state.is_prepared() {
                return Err(Error::invalid_options(
                    "commit cannot provide a commit timestamp to an unprepared transaction",
                ));
            }
            if commit_timestamp.is_null() {
                return Err(Error::invalid_options("'commit_timestamp' cannot be null"));
            }
            self.check_is_active_transaction(&inner, txn_number, true)?;
            inner.txn_state.transition_to(
                TxnStateKind::CommittingWithPrepare,
                TransitionValidation::Validate,
            );
            op_ctx.recovery_unit_mut().set_commit_timestamp(commit_timestamp);
        }

        let observer = self.service.op_observer();
        observer.on_transaction_commit(op_ctx, true)?;

        {
            let inner = self.inner.lock();
            self.check_is_active_transaction(&inner, txn_number, true)?;
        }

        self.commit_transaction_storage(op_ctx)
    }

    /// The shared storage-commit tail: commit the write unit of work
    /// without the mutex held, then either finish as `Committed` or
    /// fall back to `Aborted`. Always leaves the operation with a fresh
    /// recovery unit and no lock timeout cap.
    fn commit_transaction_storage(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let wuow = match op_ctx.take_txn_write_unit_of_work() {
            Some(wuow) => wuow,
            None => fatal(50768, "commit without a write unit of work"),
        };
        let commit_result = op_ctx.commit_write_unit_of_work(wuow);

        let now_micros = self.service.clock().now_micros();
        let metrics = self.service.transactions_metrics();
        {
            let mut inner = self.inner.lock();
            if commit_result.is_ok() {
                // Write-concern waits must cover the data read at the
                // transaction's snapshot, even if it wrote nothing.
                op_ctx.client().advance_last_op(inner.speculative_read_op_time);

                inner
                    .txn_state
                    .transition_to(TxnStateKind::Committed, TransitionValidation::Validate);
                metrics.increment_total_committed();
                if let Some(stats) = inner.stats.as_mut() {
                    stats.set_end_time(now_micros);
                    if stats.is_active() {
                        stats.set_inactive(now_micros);
                    }
                    stats.update_last_client_info(op_ctx.client());
                }
                metrics.decrement_current_open();
                metrics.decrement_current_active();
            } else if op_ctx.txn_number() == Some(inner.active_txn_number) {
                // The storage commit failed while the mutex was free;
                // unless migration moved the transaction on, record the
                // abort.
                tracing::warn!(
                    session_id = %self.session_id,
                    txn_number = inner.active_txn_number,
                    "storage commit failed, transaction aborted"
                );
                inner
                    .txn_state
                    .transition_to(TxnStateKind::Aborted, TransitionValidation::Validate);
                metrics.decrement_current_active();
                if let Some(stats) = inner.stats.as_mut() {
                    stats.set_end_time(now_micros);
                    if stats.is_active() {
                        stats.set_inactive(now_micros);
                    }
                    stats.update_last_client_info(op_ctx.client());
                }
                metrics.increment_total_aborted();
                metrics.decrement_current_open();
            }
        }

        // Post-transaction writes must run without transactional
        // settings such as a read timestamp.
        let fresh = self.service.storage_engine().new_recovery_unit();
        op_ctx.replace_recovery_unit(fresh, RecoveryUnitState::NotInUnitOfWork);
        op_ctx.locker_mut().unset_max_lock_timeout();

        commit_result
    }

    /// Abort the session's transaction on behalf of the user-visible
    /// abortTransaction command, clearing the operation's write unit of
    /// work and transactional settings.
    pub fn abort_active_transaction(&self, op_ctx: &mut OperationContext) {
        let mut inner = self.inner.lock();

        if !inner.txn_state.in_multi_document_transaction() {
            return;
        }

        self.abort_transaction_locked(&mut inner);

        op_ctx.abort_txn_write_unit_of_work();
        let fresh = self.service.storage_engine().new_recovery_unit();
        op_ctx.replace_recovery_unit(fresh, RecoveryUnitState::NotInUnitOfWork);
        op_ctx.locker_mut().unset_max_lock_timeout();

        if let Some(stats) = inner.stats.as_mut() {
            stats.update_last_client_info(op_ctx.client());
        }
    }

    /// Abort an in-progress transaction from outside a checkout (kill,
    /// catalog sweep). Prepared transactions are left alone; only an
    /// explicit abort command may end them.
    pub fn abort_arbitrary_transaction(&self) {
        let mut inner = self.inner.lock();
        self.abort_arbitrary_locked(&mut inner);
    }

    /// [`Session::abort_arbitrary_transaction`], but only once the
    /// transaction's deadline has passed.
    pub fn abort_arbitrary_transaction_if_expired(&self) {
        let mut inner = self.inner.lock();
        let now = self.service.clock().now();
        match inner.transaction_expire_date {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }
        tracing::warn!(
            session_id = %self.session_id,
            txn_number = inner.active_txn_number,
            "aborting expired transaction"
        );
        self.abort_arbitrary_locked(&mut inner);
    }

    fn abort_arbitrary_locked(&self, inner: &mut SessionInner) {
        if !inner.txn_state.is_in_progress() {
            return;
        }
        self.abort_transaction_locked(inner);
    }

    fn abort_transaction_locked(&self, inner: &mut SessionInner) {
        let metrics = self.service.transactions_metrics();
        if inner.txn_resource_stash.is_some() {
            metrics.decrement_current_inactive();
        } else {
            metrics.decrement_current_active();
        }

        inner.txn_resource_stash = None;
        inner.transaction_operation_bytes = 0;
        inner.transaction_operations.clear();
        inner
            .txn_state
            .transition_to(TxnStateKind::Aborted, TransitionValidation::Validate);
        inner.speculative_read_op_time = OpTime::null();
        metrics.increment_total_aborted();

        let now_micros = self.service.clock().now_micros();
        if let Some(stats) = inner.stats.as_mut() {
            stats.set_end_time(now_micros);
            if stats.is_active() {
                stats.set_inactive(now_micros);
            }
        }
        metrics.decrement_current_open();
    }

    // =========================================================================
    // Operation buffer
    // =========================================================================

    /// Buffer a write descriptor on the in-progress transaction for
    /// later oplog emission.
    ///
    /// # Errors
    ///
    /// [`Error::TransactionTooLarge`] when the buffer exceeds
    /// [`MAX_INTERNAL_DOCUMENT_SIZE`], and active-transaction
    /// violations.
    pub fn add_transaction_operation(
        &self,
        op_ctx: &mut OperationContext,
        operation: ReplOperation,
    ) -> Result<()> {
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50761, "buffered operations require a transaction number"),
        };

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if !inner.txn_state.is_in_progress() {
            fatal(
                50762,
                &format!(
                    "operations may only be added to an in-progress transaction, current state: {}",
                    inner.txn_state.kind()
                ),
            );
        }
        if inner.autocommit || inner.active_txn_number == UNINITIALIZED_TXN_NUMBER {
            fatal(50763, "operation buffered outside a multi-statement transaction");
        }
        if !op_ctx.in_write_unit_of_work() {
            fatal(50764, "operation buffered outside a write unit of work");
        }

        let size = operation.size_bytes();
        inner.transaction_operations.push(operation);
        inner.transaction_operation_bytes += size;
        if let Some(stats) = inner.stats.as_mut() {
            stats.add_metrics(&AdditiveMetrics {
                operations: 1,
                operation_bytes: size as u64,
            });
        }

        // The serialized form carries overhead on top of this running
        // total, so the commit can still reject a transaction that fit
        // here; failing early avoids exhausting server memory.
        if inner.transaction_operation_bytes > MAX_INTERNAL_DOCUMENT_SIZE {
            return Err(Error::TransactionTooLarge {
                size: inner.transaction_operation_bytes,
                limit: MAX_INTERNAL_DOCUMENT_SIZE,
            });
        }
        Ok(())
    }

    /// Move the buffered operations out for oplog emission. Only legal
    /// while prepared or committing without prepare.
    ///
    /// # Errors
    ///
    /// Active-transaction violations.
    pub fn end_transaction_and_retrieve_operations(
        &self,
        op_ctx: &mut OperationContext,
    ) -> Result<Vec<ReplOperation>> {
        let txn_number = match op_ctx.txn_number() {
            Some(txn_number) => txn_number,
            None => fatal(50789, "retrieving operations requires a transaction number"),
        };

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if !(inner.txn_state.is_prepared() || inner.txn_state.is_committing_without_prepare()) {
            fatal(
                50765,
                &format!(
                    "operations may only be retrieved from a prepared or committing transaction, \
                     current state: {}",
                    inner.txn_state.kind()
                ),
            );
        }
        if inner.autocommit {
            fatal(50766, "operation retrieval outside a multi-statement transaction");
        }

        inner.transaction_operation_bytes = 0;
        Ok(std::mem::take(&mut inner.transaction_operations))
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// CurOp-style report of a stashed (inactive) transaction, or
    /// `None` when nothing is stashed.
    pub fn report_stashed_state(&self) -> Option<Value> {
        let inner = self.inner.lock();
        let stash = inner.txn_resource_stash.as_ref()?;
        let locker_info = stash.locker_info()?;

        if inner.active_txn_number == UNINITIALIZED_TXN_NUMBER {
            fatal(50769, "stashed transaction without an active transaction number");
        }
        let stats = inner.stats.as_ref()?;
        let last_client = stats.last_client_info();

        Some(json!({
            "host": self.service.host_and_port(),
            "desc": "inactive transaction",
            "client": last_client.client_host_and_port,
            "connectionId": last_client.connection_id,
            "appName": last_client.app_name,
            "clientMetadata": last_client.client_metadata,
            "lsid": self.session_id,
            "transaction": self.report_transaction_stats_locked(&inner, stash.read_concern()),
            "waitingForLock": false,
            "active": false,
            "locks": serde_json::to_value(&locker_info).unwrap_or(Value::Null),
        }))
    }

    /// The `transaction` subdocument for an operation currently
    /// attached to this session, or `None` while a stash exists (the
    /// stashed report covers it).
    pub fn report_unstashed_state(&self, read_concern: &ReadConcernArgs) -> Option<Value> {
        let inner = self.inner.lock();
        if inner.txn_resource_stash.is_some() {
            return None;
        }
        Some(json!({
            "transaction": self.report_transaction_stats_locked(&inner, read_concern),
        }))
    }

    fn report_transaction_stats_locked(
        &self,
        inner: &SessionInner,
        read_concern: &ReadConcernArgs,
    ) -> Value {
        let mut parameters = json!({ "txnNumber": inner.active_txn_number });

        if !inner.txn_state.in_multi_document_transaction() {
            // Retryable writes report only the transaction number.
            return json!({ "parameters": parameters });
        }

        parameters["autocommit"] = json!(inner.autocommit);
        parameters["readConcern"] = serde_json::to_value(read_concern).unwrap_or(Value::Null);

        let stats = match inner.stats.as_ref() {
            Some(stats) => stats,
            None => fatal(50770, "multi-statement transaction without stats"),
        };
        let now_micros = self.service.clock().now_micros();
        json!({
            "parameters": parameters,
            "readTimestamp": inner.speculative_read_op_time.timestamp,
            "startWallClockTime": stats.start_time_micros() / 1000,
            "timeOpenMicros": stats.duration_micros(now_micros),
            "timeActiveMicros": stats.time_active_micros(now_micros),
            "timeInactiveMicros": stats.time_inactive_micros(now_micros),
        })
    }

    /// Single-line report of a terminated transaction for the slow
    /// transaction log.
    pub fn transaction_info_for_log(&self, lock_stats: &LockerInfo) -> String {
        let inner = self.inner.lock();

        if !(inner.txn_state.is_committed() || inner.txn_state.is_aborted()) {
            fatal(50771, "transaction log line requires a terminated transaction");
        }
        let stats = match inner.stats.as_ref() {
            Some(stats) => stats,
            None => fatal(50772, "transaction log line without stats"),
        };

        let parameters = json!({
            "lsid": self.session_id,
            "txnNumber": inner.active_txn_number,
            "autocommit": inner.autocommit,
        });
        let termination_cause = if inner.txn_state.is_committed() {
            "committed"
        } else {
            "aborted"
        };
        let now_micros = self.service.clock().now_micros();
        let locks = serde_json::to_value(lock_stats).unwrap_or(Value::Null);

        format!(
            "parameters:{parameters}, readTimestamp:{}, {} terminationCause:{termination_cause} \
             timeActiveMicros:{} timeInactiveMicros:{} numYields:0 locks:{locks} {}ms",
            inner.speculative_read_op_time.timestamp,
            stats.additive_metrics().report(),
            stats.time_active_micros(now_micros),
            stats.time_inactive_micros(now_micros),
            stats.duration_micros(now_micros) / 1000,
        )
    }

    // =========================================================================
    // Internal helpers (mutex held)
    // =========================================================================

    fn check_valid(&self, inner: &SessionInner) -> Result<()> {
        if !inner.is_valid {
            return Err(Error::conflicting_operation(format!(
                "session {} was concurrently modified and the operation must be retried",
                self.session_id
            )));
        }
        Ok(())
    }

    fn check_txn_valid(&self, inner: &SessionInner, txn_number: TxnNumber) -> Result<()> {
        if txn_number < inner.active_txn_number {
            return Err(Error::TransactionTooOld {
                session_id: self.session_id,
                txn_number,
                active_txn_number: inner.active_txn_number,
            });
        }
        Ok(())
    }

    fn check_is_active_transaction(
        &self,
        inner: &SessionInner,
        txn_number: TxnNumber,
        check_abort: bool,
    ) -> Result<()> {
        if txn_number != inner.active_txn_number {
            return Err(Error::conflicting_operation(format!(
                "cannot perform operations on transaction {txn_number} on session {} because a \
                 different transaction {} is now active",
                self.session_id, inner.active_txn_number
            )));
        }
        if check_abort && inner.txn_state.is_aborted() {
            return Err(Error::transaction_aborted(txn_number));
        }
        Ok(())
    }

    fn check_statement_executed_locked(
        &self,
        inner: &SessionInner,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<OpTime>> {
        self.check_valid(inner)?;
        self.check_is_active_transaction(inner, txn_number, false)?;

        // Retries are not detected for multi-statement transactions.
        if !inner.txn_state.is_none() {
            return Ok(None);
        }

        match inner.committed_statements.get(&stmt_id) {
            None => {
                if inner.has_incomplete_history {
                    return Err(Error::incomplete_history(format!(
                        "incomplete history detected for transaction {txn_number} on session {}",
                        self.session_id
                    )));
                }
                Ok(None)
            }
            Some(op_time) => {
                match inner.last_written_record.as_ref() {
                    Some(record) if record.txn_num == txn_number => {}
                    _ => fatal(50756, "committed statements without a matching durable record"),
                }
                Ok(Some(*op_time))
            }
        }
    }

    fn last_write_date_locked(&self, inner: &SessionInner, txn_number: TxnNumber) -> Result<WallTime> {
        self.check_valid(inner)?;
        self.check_is_active_transaction(inner, txn_number, false)?;

        Ok(inner
            .last_written_record
            .as_ref()
            .filter(|record| record.txn_num == txn_number)
            .map(|record| record.last_write_date)
            .unwrap_or(WallTime::MIN))
    }

    /// Reset per-transaction state for a new active number. Any
    /// in-progress transaction is implicitly aborted first; a prepared
    /// one trips the state machine (it must be completed explicitly).
    fn set_active_txn_locked(&self, inner: &mut SessionInner, txn_number: TxnNumber) {
        if inner.txn_state.is_in_progress() {
            self.abort_transaction_locked(inner);
        }
        inner.active_txn_number = txn_number;
        inner.committed_statements.clear();
        inner.has_incomplete_history = false;
        inner
            .txn_state
            .transition_to(TxnStateKind::None, TransitionValidation::Validate);
        inner.stats = None;
        inner.speculative_read_op_time = OpTime::null();
        inner.transaction_expire_date = None;
    }

    fn make_session_record(
        &self,
        txn_number: TxnNumber,
        last_write_op_time: OpTime,
        last_write_date: WallTime,
    ) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id,
            txn_num: txn_number,
            last_write_op_time,
            last_write_date,
        }
    }

    /// Register the post-commit cache update on the operation's
    /// recovery unit, then run the transactional-write failpoint.
    fn register_update_cache_on_commit(
        self: &Arc<Self>,
        op_ctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_op_time: OpTime,
    ) -> Result<()> {
        let session = Arc::clone(self);
        let service = Arc::clone(&self.service);
        op_ctx.recovery_unit_mut().on_commit(Box::new(move |_commit_ts| {
            service
                .retryable_writes_stats()
                .increment_transactions_collection_write_count();

            let mut inner = session.inner.lock();

            if !inner.is_valid {
                // An invalidate won the race; the next refresh reloads
                // everything this hook would have cached.
                return;
            }

            // The cached row advances monotonically by max, never by
            // assignment, so a racing invalidate+refresh that installed
            // a newer row is preserved.
            match inner.last_written_record.as_mut() {
                None => {
                    inner.last_written_record = Some(SessionRecord {
                        session_id: session.session_id,
                        txn_num: txn_number,
                        last_write_op_time: last_stmt_op_time,
                        last_write_date: WallTime::MIN,
                    });
                }
                Some(record) => {
                    if txn_number > record.txn_num {
                        record.txn_num = txn_number;
                    }
                    if last_stmt_op_time > record.last_write_op_time {
                        record.last_write_op_time = last_stmt_op_time;
                    }
                }
            }

            if txn_number > inner.active_txn_number {
                // An invalidate+refresh finished mid-flight before any
                // write for this number existed; catch the active
                // number up so the cache update below lands.
                session.set_active_txn_locked(&mut inner, txn_number);
                inner.autocommit = true;
            }

            if txn_number == inner.active_txn_number {
                for stmt_id in &stmt_ids {
                    if *stmt_id == INCOMPLETE_HISTORY_STMT_ID {
                        inner.has_incomplete_history = true;
                        continue;
                    }
                    match inner.committed_statements.entry(*stmt_id) {
                        Entry::Occupied(existing) => {
                            fassert_on_repeated_execution(
                                &session.session_id,
                                txn_number,
                                *stmt_id,
                                *existing.get(),
                                last_stmt_op_time,
                            );
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(last_stmt_op_time);
                        }
                    }
                }
            }
        }));

        if let Some(options) = self
            .service
            .failpoints()
            .on_primary_transactional_write
            .options_if_enabled()
        {
            if options.close_connection {
                op_ctx.client().disconnect();
            }
            if let Some(code) = options.fail_before_commit_exception_code {
                return Err(Error::FailPointError {
                    code,
                    message: format!(
                        "failing write for {}:{txn_number} due to failpoint; the write must not \
                         be reflected",
                        self.session_id
                    ),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
