//! In-memory implementations of every collaborator trait, plus a
//! harness that wires them into a [`ServiceContext`].
//!
//! These back the unit and scenario tests of the whole workspace. They
//! model just enough behavior to exercise the session layer: snapshot
//! identity, unit-of-work nesting, deferred unlocks, commit callbacks,
//! record versioning, and a manually advanced clock.

use crate::context::{Client, OperationContext, ServiceContext};
use crate::error::{Error, Result};
use crate::record::{
    OplogEntry, OplogEntryBody, ReplOperation, SessionRecord, UpdateEntryArgs, DEAD_END_SENTINEL,
};
use crate::traits::{
    ClockSource, CommitCallback, HeldLock, LockMode, Locker, LockerClientState, LockerInfo,
    OpObserver, OplogReader, RecordId, RecordStore, RecoveryUnit, ReadSource,
    ReplicationCoordinator, SnapshotVersion, StorageEngine,
};
use crate::types::{
    OpTime, SessionId, StmtId, Timestamp, TxnNumber, WallTime, INCOMPLETE_HISTORY_STMT_ID,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// State shared between a [`MemStorageEngine`] and the recovery units
/// and lockers it hands out.
#[derive(Debug, Default)]
struct EngineShared {
    next_snapshot_id: AtomicU64,
    next_timestamp: AtomicU64,
    fail_commits: AtomicBool,
    contend_global_lock: AtomicBool,
}

/// In-memory storage engine.
#[derive(Debug, Default)]
pub struct MemStorageEngine {
    shared: Arc<EngineShared>,
}

impl MemStorageEngine {
    /// Fresh engine.
    pub fn new() -> Arc<Self> {
        Arc::new(MemStorageEngine::default())
    }

    /// Make every subsequent unit-of-work commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.shared.fail_commits.store(fail, Ordering::Relaxed);
    }

    /// Make the global lock unobtainable, so capped requests time out.
    pub fn contend_global_lock(&self, contended: bool) {
        self.shared
            .contend_global_lock
            .store(contended, Ordering::Relaxed);
    }
}

impl StorageEngine for MemStorageEngine {
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit> {
        Box::new(MemRecoveryUnit {
            shared: Arc::clone(&self.shared),
            snapshot_id: self.shared.next_snapshot_id.fetch_add(1, Ordering::Relaxed),
            read_source: ReadSource::Default,
            read_timestamp: None,
            in_unit_of_work: false,
            prepare_timestamp: None,
            commit_timestamp: None,
            callbacks: Vec::new(),
        })
    }

    fn new_locker(&self) -> Box<dyn Locker> {
        Box::new(MemLocker {
            shared: Arc::clone(&self.shared),
            global: None,
            pending_global_unlock: false,
            wuow_depth: 0,
            has_ticket: true,
            thread: Some(std::thread::current().id()),
            max_timeout: None,
            ever_locked: false,
        })
    }
}

/// In-memory recovery unit.
pub struct MemRecoveryUnit {
    shared: Arc<EngineShared>,
    snapshot_id: u64,
    read_source: ReadSource,
    read_timestamp: Option<Timestamp>,
    in_unit_of_work: bool,
    prepare_timestamp: Option<Timestamp>,
    commit_timestamp: Option<Timestamp>,
    callbacks: Vec<CommitCallback>,
}

impl MemRecoveryUnit {
    fn next_timestamp(&self) -> Timestamp {
        Timestamp(self.shared.next_timestamp.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The configured read source.
    pub fn timestamp_read_source(&self) -> ReadSource {
        self.read_source
    }
}

impl RecoveryUnit for MemRecoveryUnit {
    fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }

    fn set_timestamp_read_source(&mut self, source: ReadSource) {
        self.read_source = source;
    }

    fn preallocate_snapshot(&mut self) {
        if self.read_timestamp.is_none() {
            self.read_timestamp = Some(self.next_timestamp());
        }
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        self.read_timestamp
    }

    fn begin_unit_of_work(&mut self) {
        self.in_unit_of_work = true;
    }

    fn commit_unit_of_work(&mut self) -> Result<()> {
        if !self.in_unit_of_work {
            return Err(Error::internal("commit outside a unit of work"));
        }
        if self.shared.fail_commits.load(Ordering::Relaxed) {
            return Err(Error::internal("injected commit failure"));
        }
        self.in_unit_of_work = false;
        let commit_ts = self.commit_timestamp.or(self.prepare_timestamp);
        for callback in self.callbacks.drain(..) {
            callback(commit_ts);
        }
        Ok(())
    }

    fn abort_unit_of_work(&mut self) {
        self.in_unit_of_work = false;
        self.prepare_timestamp = None;
        self.commit_timestamp = None;
        self.callbacks.clear();
    }

    fn prepare_unit_of_work(&mut self) -> Result<Timestamp> {
        if !self.in_unit_of_work {
            return Err(Error::internal("prepare outside a unit of work"));
        }
        let ts = self.next_timestamp();
        self.prepare_timestamp = Some(ts);
        Ok(ts)
    }

    fn prepare_timestamp(&self) -> Option<Timestamp> {
        self.prepare_timestamp
    }

    fn set_commit_timestamp(&mut self, timestamp: Timestamp) {
        self.commit_timestamp = Some(timestamp);
    }

    fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_timestamp
    }

    fn on_commit(&mut self, callback: CommitCallback) {
        self.callbacks.push(callback);
    }
}

impl std::fmt::Debug for MemRecoveryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRecoveryUnit")
            .field("snapshot_id", &self.snapshot_id)
            .field("in_unit_of_work", &self.in_unit_of_work)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// In-memory locker with two-phase unlock inside write units of work.
#[derive(Debug)]
pub struct MemLocker {
    shared: Arc<EngineShared>,
    global: Option<LockMode>,
    pending_global_unlock: bool,
    wuow_depth: u32,
    has_ticket: bool,
    thread: Option<std::thread::ThreadId>,
    max_timeout: Option<Duration>,
    ever_locked: bool,
}

impl MemLocker {
    /// Whether the locker holds an execution ticket.
    pub fn has_ticket(&self) -> bool {
        self.has_ticket
    }

    /// Whether the locker is bound to the calling thread.
    pub fn is_bound_to_current_thread(&self) -> bool {
        self.thread == Some(std::thread::current().id())
    }
}

impl Locker for MemLocker {
    fn lock_global(&mut self, mode: LockMode) -> Result<()> {
        if self.shared.contend_global_lock.load(Ordering::Relaxed) {
            return Err(Error::lock_timeout(format!(
                "global lock in mode {} (cap: {:?})",
                mode.as_str(),
                self.max_timeout
            )));
        }
        self.global = Some(mode);
        self.pending_global_unlock = false;
        self.ever_locked = true;
        Ok(())
    }

    fn unlock_global(&mut self) {
        if self.wuow_depth > 0 {
            self.pending_global_unlock = true;
        } else {
            self.global = None;
        }
    }

    fn is_locked(&self) -> bool {
        self.global.is_some()
    }

    fn release_ticket(&mut self) {
        self.has_ticket = false;
    }

    fn reacquire_ticket(&mut self) -> Result<()> {
        self.has_ticket = true;
        Ok(())
    }

    fn unset_thread_id(&mut self) {
        self.thread = None;
    }

    fn rebind_to_current_thread(&mut self) {
        self.thread = Some(std::thread::current().id());
    }

    fn set_max_lock_timeout(&mut self, timeout: Duration) {
        self.max_timeout = Some(timeout);
    }

    fn unset_max_lock_timeout(&mut self) {
        self.max_timeout = None;
    }

    fn max_lock_timeout(&self) -> Option<Duration> {
        self.max_timeout
    }

    fn begin_write_unit_of_work(&mut self) {
        self.wuow_depth += 1;
    }

    fn end_write_unit_of_work(&mut self) {
        if self.wuow_depth == 0 {
            return;
        }
        self.wuow_depth -= 1;
        if self.wuow_depth == 0 && self.pending_global_unlock {
            self.global = None;
            self.pending_global_unlock = false;
        }
    }

    fn in_a_write_unit_of_work(&self) -> bool {
        self.wuow_depth > 0
    }

    fn client_state(&self) -> LockerClientState {
        if self.is_locked() {
            LockerClientState::Active
        } else {
            LockerClientState::Inactive
        }
    }

    fn locker_info(&self) -> Option<LockerInfo> {
        if !self.ever_locked {
            return None;
        }
        let locks = self
            .global
            .iter()
            .map(|mode| HeldLock {
                resource: "Global".to_string(),
                mode: mode.as_str().to_string(),
            })
            .collect();
        Some(LockerInfo {
            locks,
            total_wait_micros: 0,
        })
    }
}

/// In-memory oplog keyed by optime.
#[derive(Debug, Default)]
pub struct MemOplog {
    entries: Mutex<HashMap<OpTime, OplogEntry>>,
}

impl MemOplog {
    /// Fresh oplog.
    pub fn new() -> Arc<Self> {
        Arc::new(MemOplog::default())
    }

    /// Append an entry.
    pub fn insert(&self, entry: OplogEntry) {
        self.entries.lock().insert(entry.op_time, entry);
    }

    /// Remove the entry at `op_time`, simulating truncation.
    pub fn truncate(&self, op_time: OpTime) {
        self.entries.lock().remove(&op_time);
    }
}

impl OplogReader for MemOplog {
    fn fetch(&self, op_time: OpTime) -> Result<OplogEntry> {
        self.entries.lock().get(&op_time).cloned().ok_or_else(|| {
            Error::incomplete_history(format!("oplog entry at {op_time} no longer exists"))
        })
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    record_id: RecordId,
    record: SessionRecord,
    version: u64,
}

/// In-memory session-records collection.
#[derive(Debug)]
pub struct MemRecordStore {
    rows: Mutex<HashMap<SessionId, StoredRow>>,
    next_record_id: AtomicU64,
    next_version: AtomicU64,
    collection_exists: AtomicBool,
    id_index_exists: AtomicBool,
    last_update_args: Mutex<Option<UpdateEntryArgs>>,
}

impl Default for MemRecordStore {
    fn default() -> Self {
        MemRecordStore {
            rows: Mutex::new(HashMap::new()),
            next_record_id: AtomicU64::new(1),
            next_version: AtomicU64::new(1),
            collection_exists: AtomicBool::new(true),
            id_index_exists: AtomicBool::new(true),
            last_update_args: Mutex::new(None),
        }
    }
}

impl MemRecordStore {
    /// Fresh store.
    pub fn new() -> Arc<Self> {
        Arc::new(MemRecordStore::default())
    }

    /// The stored row for `session_id`, if any.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.rows.lock().get(session_id).map(|row| row.record.clone())
    }

    /// Simulate the collection having been dropped.
    pub fn set_collection_exists(&self, exists: bool) {
        self.collection_exists.store(exists, Ordering::Relaxed);
    }

    /// Bump the stored row's version without changing its contents, as
    /// a concurrent writer would.
    pub fn touch(&self, session_id: &SessionId) {
        if let Some(row) = self.rows.lock().get_mut(session_id) {
            row.version = self.next_version.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Update-entry args passed with the most recent in-place update.
    pub fn last_update_args(&self) -> Option<UpdateEntryArgs> {
        self.last_update_args.lock().clone()
    }
}

impl RecordStore for MemRecordStore {
    fn collection_exists(&self) -> bool {
        self.collection_exists.load(Ordering::Relaxed)
    }

    fn id_index_exists(&self) -> bool {
        self.id_index_exists.load(Ordering::Relaxed)
    }

    fn find_id(&self, session_id: &SessionId) -> Option<RecordId> {
        self.rows.lock().get(session_id).map(|row| row.record_id)
    }

    fn read(&self, record_id: &RecordId) -> Result<(SessionRecord, SnapshotVersion)> {
        self.rows
            .lock()
            .values()
            .find(|row| row.record_id == *record_id)
            .map(|row| (row.record.clone(), row.version))
            .ok_or_else(|| Error::internal(format!("record {record_id:?} vanished")))
    }

    fn insert(&self, record: SessionRecord) -> Result<()> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&record.session_id) {
            return Err(Error::duplicate_key(format!(
                "session record for {}",
                record.session_id
            )));
        }
        let row = StoredRow {
            record_id: RecordId(self.next_record_id.fetch_add(1, Ordering::Relaxed)),
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
            record: record.clone(),
        };
        rows.insert(record.session_id, row);
        Ok(())
    }

    fn update(
        &self,
        record_id: &RecordId,
        expected: SnapshotVersion,
        record: SessionRecord,
        args: &UpdateEntryArgs,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .values_mut()
            .find(|row| row.record_id == *record_id)
            .ok_or_else(|| Error::internal(format!("record {record_id:?} vanished")))?;
        if row.version != expected {
            return Err(Error::write_conflict(format!(
                "session record for {} changed under snapshot",
                record.session_id
            )));
        }
        row.record = record;
        row.version = self.next_version.fetch_add(1, Ordering::Relaxed);
        *self.last_update_args.lock() = Some(args.clone());
        Ok(())
    }
}

/// Replication coordinator with a settable term.
#[derive(Debug)]
pub struct MemReplCoordinator {
    term: AtomicI64,
}

impl MemReplCoordinator {
    /// Coordinator starting at term 1.
    pub fn new() -> Arc<Self> {
        Arc::new(MemReplCoordinator {
            term: AtomicI64::new(1),
        })
    }

    /// Change the term.
    pub fn set_term(&self, term: i64) {
        self.term.store(term, Ordering::Relaxed);
    }
}

impl ReplicationCoordinator for MemReplCoordinator {
    fn term(&self) -> i64 {
        self.term.load(Ordering::Relaxed)
    }
}

/// Manually advanced clock.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    micros: AtomicU64,
}

impl ManualClock {
    /// Clock starting at an arbitrary fixed epoch offset.
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock {
            millis: AtomicI64::new(1_600_000_000_000),
            micros: AtomicU64::new(1_600_000_000_000_000),
        })
    }

    /// Advance the clock.
    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::Relaxed);
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> WallTime {
        WallTime::from_millis(self.millis.load(Ordering::Relaxed))
    }

    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::Relaxed)
    }
}

/// What the recording observer saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    /// `on_transaction_prepare` fired.
    Prepare,
    /// `on_transaction_commit` fired.
    Commit {
        /// Whether the transaction had been prepared.
        was_prepared: bool,
    },
}

/// Op-observer that records its invocations and can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingOpObserver {
    events: Mutex<Vec<ObserverEvent>>,
    fail_on_prepare: AtomicBool,
}

impl RecordingOpObserver {
    /// Fresh observer.
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingOpObserver::default())
    }

    /// Everything observed so far.
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().clone()
    }

    /// Make the next `on_transaction_prepare` fail.
    pub fn fail_on_prepare(&self, fail: bool) {
        self.fail_on_prepare.store(fail, Ordering::Relaxed);
    }
}

impl OpObserver for RecordingOpObserver {
    fn on_transaction_prepare(&self, _op_ctx: &mut OperationContext) -> Result<()> {
        if self.fail_on_prepare.load(Ordering::Relaxed) {
            return Err(Error::internal("injected prepare observer failure"));
        }
        self.events.lock().push(ObserverEvent::Prepare);
        Ok(())
    }

    fn on_transaction_commit(
        &self,
        _op_ctx: &mut OperationContext,
        was_prepared: bool,
    ) -> Result<()> {
        self.events.lock().push(ObserverEvent::Commit { was_prepared });
        Ok(())
    }
}

/// A fully wired in-memory service context plus handles to every fake.
#[derive(Debug)]
pub struct TestHarness {
    /// The assembled service context.
    pub service: Arc<ServiceContext>,
    /// The storage engine fake.
    pub storage: Arc<MemStorageEngine>,
    /// The op-observer fake.
    pub observer: Arc<RecordingOpObserver>,
    /// The oplog fake.
    pub oplog: Arc<MemOplog>,
    /// The session-records fake.
    pub records: Arc<MemRecordStore>,
    /// The replication coordinator fake.
    pub repl: Arc<MemReplCoordinator>,
    /// The manual clock.
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    /// Wire up a fresh harness.
    pub fn new() -> Self {
        let storage = MemStorageEngine::new();
        let observer = RecordingOpObserver::new();
        let oplog = MemOplog::new();
        let records = MemRecordStore::new();
        let repl = MemReplCoordinator::new();
        let clock = ManualClock::new();
        let service = ServiceContext::new(
            storage.clone(),
            observer.clone(),
            oplog.clone(),
            records.clone(),
            repl.clone(),
            clock.clone(),
        );
        TestHarness {
            service,
            storage,
            observer,
            oplog,
            records,
            repl,
            clock,
        }
    }

    /// A client named `name`.
    pub fn new_client(&self, name: &str) -> Arc<Client> {
        Client::new(
            name,
            "127.0.0.1:27017",
            7,
            "test-app",
            json!({ "driver": "test" }),
        )
    }

    /// An operation context on `client`.
    pub fn new_operation(&self, client: &Arc<Client>) -> OperationContext {
        OperationContext::new(&self.service, client)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        TestHarness::new()
    }
}

/// A retryable-write oplog entry for chain-building in tests.
pub fn write_entry(
    session_id: SessionId,
    txn_number: TxnNumber,
    stmt_id: StmtId,
    op_time: OpTime,
    prev_op_time: Option<OpTime>,
) -> OplogEntry {
    OplogEntry {
        op_time,
        prev_op_time,
        session_id,
        txn_number: Some(txn_number),
        stmt_id: Some(stmt_id),
        wall_clock_time: WallTime::from_millis(1_600_000_000_000),
        body: OplogEntryBody::Write(ReplOperation::insert("test.coll", json!({ "x": 1 }))),
        object2: None,
    }
}

/// A dead-end sentinel entry marking chain truncation.
pub fn sentinel_entry(
    session_id: SessionId,
    txn_number: TxnNumber,
    op_time: OpTime,
    prev_op_time: Option<OpTime>,
) -> OplogEntry {
    OplogEntry {
        op_time,
        prev_op_time,
        session_id,
        txn_number: Some(txn_number),
        stmt_id: Some(INCOMPLETE_HISTORY_STMT_ID),
        wall_clock_time: WallTime::from_millis(1_600_000_000_000),
        body: OplogEntryBody::Noop,
        object2: Some(DEAD_END_SENTINEL.clone()),
    }
}

/// An apply-ops command entry marking a committed transaction.
pub fn apply_ops_entry(
    session_id: SessionId,
    txn_number: TxnNumber,
    stmt_id: StmtId,
    op_time: OpTime,
    prev_op_time: Option<OpTime>,
) -> OplogEntry {
    OplogEntry {
        op_time,
        prev_op_time,
        session_id,
        txn_number: Some(txn_number),
        stmt_id: Some(stmt_id),
        wall_clock_time: WallTime::from_millis(1_600_000_000_000),
        body: OplogEntryBody::Command(crate::record::CommandKind::ApplyOps),
        object2: None,
    }
}
