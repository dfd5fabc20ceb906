//! Execution context plumbing: the service-wide collaborator bundle,
//! the per-connection client, and the per-operation context that owns
//! the locker, recovery unit, and write-unit-of-work slot.
//!
//! Lock ordering is fixed: **client lock before session mutex**. A
//! watcher thread may hold the client lock while asking for session
//! state, so taking them in the other order deadlocks.

use crate::config::TransactionParameters;
use crate::error::{fatal, Result};
use crate::failpoint::Failpoints;
use crate::metrics::{RetryableWritesStats, ServerTransactionsMetrics};
use crate::traits::{
    ClockSource, Locker, OpObserver, OplogReader, RecordStore, RecoveryUnit,
    ReplicationCoordinator, StorageEngine,
};
use crate::types::{OpTime, Timestamp, TxnNumber};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read concern level requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConcernLevel {
    /// Node-local reads.
    Local,
    /// Majority-committed reads.
    Majority,
    /// Snapshot reads at a single cluster time.
    Snapshot,
}

/// Read concern arguments attached to an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadConcernArgs {
    /// Requested level, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<ReadConcernLevel>,
    /// Read no earlier than this optime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_op_time: Option<OpTime>,
    /// Read exactly at this cluster time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_cluster_time: Option<Timestamp>,
}

impl ReadConcernArgs {
    /// Args with only a level set.
    pub fn with_level(level: ReadConcernLevel) -> Self {
        ReadConcernArgs {
            level: Some(level),
            ..ReadConcernArgs::default()
        }
    }

    /// Whether the caller sent no read concern at all.
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_op_time.is_none() && self.at_cluster_time.is_none()
    }

    /// The level to act on; absent means local.
    pub fn effective_level(&self) -> ReadConcernLevel {
        self.level.unwrap_or(ReadConcernLevel::Local)
    }
}

/// One client connection. Immutable connection metadata plus the small
/// amount of mutable per-client replication state.
#[derive(Debug)]
pub struct Client {
    desc: String,
    host_and_port: String,
    connection_id: i64,
    app_name: String,
    metadata: Value,
    in_direct_client: AtomicBool,
    connected: AtomicBool,
    lock: Mutex<()>,
    last_op: Mutex<OpTime>,
}

impl Client {
    /// Create a client for a connection.
    pub fn new(
        desc: impl Into<String>,
        host_and_port: impl Into<String>,
        connection_id: i64,
        app_name: impl Into<String>,
        metadata: Value,
    ) -> Arc<Client> {
        Arc::new(Client {
            desc: desc.into(),
            host_and_port: host_and_port.into(),
            connection_id,
            app_name: app_name.into(),
            metadata,
            in_direct_client: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            lock: Mutex::new(()),
            last_op: Mutex::new(OpTime::null()),
        })
    }

    /// Human-readable description of the connection.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Remote host and port.
    pub fn host_and_port(&self) -> &str {
        &self.host_and_port
    }

    /// Connection id.
    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    /// Application name supplied at handshake.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Driver metadata supplied at handshake.
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Take the client lock. Must be taken before any session mutex.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Mark this client as internal loopback traffic, which bypasses
    /// session tracking.
    pub fn set_in_direct_client(&self, direct: bool) {
        self.in_direct_client.store(direct, Ordering::Relaxed);
    }

    /// Whether this client is internal loopback traffic.
    pub fn is_in_direct_client(&self) -> bool {
        self.in_direct_client.load(Ordering::Relaxed)
    }

    /// Sever the connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// The client's last known replicated optime.
    pub fn last_op(&self) -> OpTime {
        *self.last_op.lock()
    }

    /// Advance the client's last optime; never moves it backwards.
    pub fn advance_last_op(&self, op_time: OpTime) {
        let mut last = self.last_op.lock();
        if op_time > *last {
            *last = op_time;
        }
    }
}

/// Process-wide bundle of collaborators, parameters, metrics, and
/// failpoints.
pub struct ServiceContext {
    storage: Arc<dyn StorageEngine>,
    op_observer: Arc<dyn OpObserver>,
    oplog: Arc<dyn OplogReader>,
    records: Arc<dyn RecordStore>,
    repl: Arc<dyn ReplicationCoordinator>,
    clock: Arc<dyn ClockSource>,
    parameters: TransactionParameters,
    metrics: ServerTransactionsMetrics,
    retryable_writes_stats: RetryableWritesStats,
    failpoints: Failpoints,
    test_commands_enabled: AtomicBool,
    host_and_port: Mutex<String>,
}

impl ServiceContext {
    /// Assemble a service context from its collaborators.
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        op_observer: Arc<dyn OpObserver>,
        oplog: Arc<dyn OplogReader>,
        records: Arc<dyn RecordStore>,
        repl: Arc<dyn ReplicationCoordinator>,
        clock: Arc<dyn ClockSource>,
    ) -> Arc<Self> {
        Arc::new(ServiceContext {
            storage,
            op_observer,
            oplog,
            records,
            repl,
            clock,
            parameters: TransactionParameters::default(),
            metrics: ServerTransactionsMetrics::default(),
            retryable_writes_stats: RetryableWritesStats::default(),
            failpoints: Failpoints::default(),
            test_commands_enabled: AtomicBool::new(false),
            host_and_port: Mutex::new("localhost:27017".to_string()),
        })
    }

    /// The address this node advertises in reports.
    pub fn host_and_port(&self) -> String {
        self.host_and_port.lock().clone()
    }

    /// Set the advertised address.
    pub fn set_host_and_port(&self, host_and_port: impl Into<String>) {
        *self.host_and_port.lock() = host_and_port.into();
    }

    /// The storage engine.
    pub fn storage_engine(&self) -> &dyn StorageEngine {
        self.storage.as_ref()
    }

    /// The op-observer.
    pub fn op_observer(&self) -> Arc<dyn OpObserver> {
        Arc::clone(&self.op_observer)
    }

    /// The oplog reader.
    pub fn oplog(&self) -> &dyn OplogReader {
        self.oplog.as_ref()
    }

    /// The session-records collection.
    pub fn record_store(&self) -> &dyn RecordStore {
        self.records.as_ref()
    }

    /// The replication coordinator.
    pub fn repl_coordinator(&self) -> &dyn ReplicationCoordinator {
        self.repl.as_ref()
    }

    /// The clock.
    pub fn clock(&self) -> &dyn ClockSource {
        self.clock.as_ref()
    }

    /// Live transaction parameters.
    pub fn parameters(&self) -> &TransactionParameters {
        &self.parameters
    }

    /// Server-wide transaction counters.
    pub fn transactions_metrics(&self) -> &ServerTransactionsMetrics {
        &self.metrics
    }

    /// Retryable-write counters.
    pub fn retryable_writes_stats(&self) -> &RetryableWritesStats {
        &self.retryable_writes_stats
    }

    /// Test failpoints.
    pub fn failpoints(&self) -> &Failpoints {
        &self.failpoints
    }

    /// Whether test-only commands are enabled on this process.
    pub fn test_commands_enabled(&self) -> bool {
        self.test_commands_enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable test-only commands.
    pub fn set_test_commands_enabled(&self, enabled: bool) {
        self.test_commands_enabled.store(enabled, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Whether the operation's recovery unit currently has an open unit of
/// work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryUnitState {
    /// No open unit of work.
    NotInUnitOfWork,
    /// A unit of work is buffering writes.
    ActiveUnitOfWork,
}

/// A scoped grouping of writes on the operation's recovery unit.
///
/// Only the top-level unit owns the recovery unit's open/commit/abort;
/// nested units piggyback on it and merely track locker nesting. The
/// value itself is passive: every effect goes through the owning
/// [`OperationContext`].
#[derive(Debug)]
pub struct WriteUnitOfWork {
    toplevel: bool,
    prepared: bool,
}

impl WriteUnitOfWork {
    /// Whether this unit has been durably prepared.
    pub fn prepared(&self) -> bool {
        self.prepared
    }
}

/// Token for a write unit of work detached from its operation while the
/// transaction is stashed. Carries what is needed to resume it.
#[derive(Debug)]
pub struct ReleasedUnitOfWork {
    prepared: bool,
}

/// Per-operation execution context.
///
/// Owns the operation's locker and recovery unit. Between an unstash
/// and the next stash these belong to the executing thread; while
/// stashed they live in the session's transaction-resource slot.
pub struct OperationContext {
    service: Arc<ServiceContext>,
    client: Arc<Client>,
    txn_number: Option<TxnNumber>,
    locker: Box<dyn Locker>,
    recovery_unit: Box<dyn RecoveryUnit>,
    ru_state: RecoveryUnitState,
    txn_wuow: Option<WriteUnitOfWork>,
    read_concern: ReadConcernArgs,
}

impl OperationContext {
    /// Create an operation context with fresh resources.
    pub fn new(service: &Arc<ServiceContext>, client: &Arc<Client>) -> Self {
        OperationContext {
            service: Arc::clone(service),
            client: Arc::clone(client),
            txn_number: None,
            locker: service.storage_engine().new_locker(),
            recovery_unit: service.storage_engine().new_recovery_unit(),
            ru_state: RecoveryUnitState::NotInUnitOfWork,
            txn_wuow: None,
            read_concern: ReadConcernArgs::default(),
        }
    }

    /// The service context.
    pub fn service(&self) -> &Arc<ServiceContext> {
        &self.service
    }

    /// The client this operation runs on behalf of.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The operation's transaction number, if one was supplied.
    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    /// Attach a transaction number to the operation.
    pub fn set_txn_number(&mut self, txn_number: TxnNumber) {
        self.txn_number = Some(txn_number);
    }

    /// The operation's read concern.
    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }

    /// Replace the operation's read concern.
    pub fn set_read_concern(&mut self, args: ReadConcernArgs) {
        self.read_concern = args;
    }

    /// The operation's locker.
    pub fn locker(&self) -> &dyn Locker {
        self.locker.as_ref()
    }

    /// The operation's locker, mutably.
    pub fn locker_mut(&mut self) -> &mut dyn Locker {
        self.locker.as_mut()
    }

    /// Swap the operation's locker, returning the previous one.
    pub fn swap_locker(&mut self, locker: Box<dyn Locker>) -> Box<dyn Locker> {
        std::mem::replace(&mut self.locker, locker)
    }

    /// The operation's recovery unit.
    pub fn recovery_unit(&self) -> &dyn RecoveryUnit {
        self.recovery_unit.as_ref()
    }

    /// The operation's recovery unit, mutably.
    pub fn recovery_unit_mut(&mut self) -> &mut dyn RecoveryUnit {
        self.recovery_unit.as_mut()
    }

    /// Replace the recovery unit and its state, returning the previous
    /// unit.
    pub fn replace_recovery_unit(
        &mut self,
        recovery_unit: Box<dyn RecoveryUnit>,
        state: RecoveryUnitState,
    ) -> Box<dyn RecoveryUnit> {
        self.ru_state = state;
        std::mem::replace(&mut self.recovery_unit, recovery_unit)
    }

    /// Current recovery unit state.
    pub fn recovery_unit_state(&self) -> RecoveryUnitState {
        self.ru_state
    }

    /// Begin a (possibly nested) write unit of work on this operation.
    pub fn begin_write_unit_of_work(&mut self) -> WriteUnitOfWork {
        self.locker.begin_write_unit_of_work();
        let toplevel = self.ru_state == RecoveryUnitState::NotInUnitOfWork;
        if toplevel {
            self.recovery_unit.begin_unit_of_work();
            self.ru_state = RecoveryUnitState::ActiveUnitOfWork;
        }
        WriteUnitOfWork {
            toplevel,
            prepared: false,
        }
    }

    /// Commit a write unit of work. At top level this commits the
    /// recovery unit and fires its commit callbacks; on failure the
    /// buffered writes are discarded and the unit is fully ended.
    ///
    /// # Errors
    ///
    /// Storage-level commit failures.
    pub fn commit_write_unit_of_work(&mut self, wuow: WriteUnitOfWork) -> Result<()> {
        let result = if wuow.toplevel {
            let result = self.recovery_unit.commit_unit_of_work();
            if result.is_err() {
                self.recovery_unit.abort_unit_of_work();
            }
            self.ru_state = RecoveryUnitState::NotInUnitOfWork;
            result
        } else {
            Ok(())
        };
        self.locker.end_write_unit_of_work();
        result
    }

    /// Abort a write unit of work, discarding buffered writes at top
    /// level.
    pub fn abort_write_unit_of_work(&mut self, wuow: WriteUnitOfWork) {
        if wuow.toplevel {
            self.recovery_unit.abort_unit_of_work();
            self.ru_state = RecoveryUnitState::NotInUnitOfWork;
        }
        self.locker.end_write_unit_of_work();
    }

    /// Begin the transaction's write unit of work and park it in the
    /// operation's slot. The slot must be empty.
    pub fn begin_txn_write_unit_of_work(&mut self) {
        if self.txn_wuow.is_some() {
            fatal(50731, "write unit of work already present on operation");
        }
        let wuow = self.begin_write_unit_of_work();
        self.txn_wuow = Some(wuow);
    }

    /// Whether the slot holds the transaction's write unit of work.
    pub fn has_txn_write_unit_of_work(&self) -> bool {
        self.txn_wuow.is_some()
    }

    /// Whether the operation is inside any write unit of work.
    pub fn in_write_unit_of_work(&self) -> bool {
        self.locker.in_a_write_unit_of_work()
    }

    /// Take the transaction's write unit of work out of the slot, for
    /// commit or abort.
    pub fn take_txn_write_unit_of_work(&mut self) -> Option<WriteUnitOfWork> {
        self.txn_wuow.take()
    }

    /// Durably prepare the transaction's write unit of work, returning
    /// the prepare timestamp assigned by the recovery unit.
    ///
    /// # Errors
    ///
    /// Storage-level prepare failures, or an internal error when no
    /// transaction unit of work is present.
    pub fn prepare_txn_write_unit_of_work(&mut self) -> Result<Timestamp> {
        match self.txn_wuow.as_mut() {
            Some(wuow) => {
                wuow.prepared = true;
                self.recovery_unit.prepare_unit_of_work()
            }
            None => fatal(50732, "prepare without a write unit of work"),
        }
    }

    /// Abort and discard the transaction's write unit of work if one is
    /// present.
    pub fn abort_txn_write_unit_of_work(&mut self) {
        if let Some(wuow) = self.txn_wuow.take() {
            self.abort_write_unit_of_work(wuow);
        }
    }

    /// Detach the transaction's write unit of work for stashing. The
    /// recovery unit keeps its snapshot and buffered writes.
    pub fn release_txn_write_unit_of_work(&mut self) -> ReleasedUnitOfWork {
        match self.txn_wuow.take() {
            Some(wuow) => ReleasedUnitOfWork {
                prepared: wuow.prepared,
            },
            None => fatal(50733, "stash without a write unit of work"),
        }
    }

    /// Re-attach a previously released write unit of work, resuming the
    /// prior snapshot on the (already re-installed) recovery unit.
    pub fn resume_txn_write_unit_of_work(&mut self, released: ReleasedUnitOfWork) {
        if self.txn_wuow.is_some() {
            fatal(50734, "resume over an existing write unit of work");
        }
        self.ru_state = RecoveryUnitState::ActiveUnitOfWork;
        self.txn_wuow = Some(WriteUnitOfWork {
            toplevel: true,
            prepared: released.prepared,
        });
    }
}

impl ReleasedUnitOfWork {
    /// Whether the detached unit had been prepared.
    pub fn prepared(&self) -> bool {
        self.prepared
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        if self.ru_state == RecoveryUnitState::ActiveUnitOfWork {
            self.recovery_unit.abort_unit_of_work();
        }
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("txn_number", &self.txn_number)
            .field("ru_state", &self.ru_state)
            .field("has_txn_wuow", &self.txn_wuow.is_some())
            .finish_non_exhaustive()
    }
}

/// Run `f` inside a fresh write unit of work, committing on `Ok` and
/// aborting on `Err`.
///
/// # Errors
///
/// Propagates `f`'s error, or the commit failure.
pub fn with_write_unit_of_work<R>(
    op_ctx: &mut OperationContext,
    f: impl FnOnce(&mut OperationContext) -> Result<R>,
) -> Result<R> {
    let wuow = op_ctx.begin_write_unit_of_work();
    match f(op_ctx) {
        Ok(value) => {
            op_ctx.commit_write_unit_of_work(wuow)?;
            Ok(value)
        }
        Err(err) => {
            op_ctx.abort_write_unit_of_work(wuow);
            Err(err)
        }
    }
}
