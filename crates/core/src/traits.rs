//! Collaborator interfaces consumed by the session layer.
//!
//! The storage engine, lock manager, replication stack, and op-observer
//! are external subsystems; the session layer sees them only through the
//! traits here. Production wiring supplies the real implementations,
//! the [`crate::testing`] module supplies in-memory ones.
//!
//! Thread safety: shared collaborators ([`StorageEngine`],
//! [`OpObserver`], [`OplogReader`], [`RecordStore`],
//! [`ReplicationCoordinator`], [`ClockSource`]) must be `Send + Sync`.
//! Per-operation resources ([`Locker`], [`RecoveryUnit`]) are owned by
//! exactly one thread at a time (the executing operation, or a stashed
//! transaction slot) and only need `Send`.

use crate::context::OperationContext;
use crate::error::Result;
use crate::record::{OplogEntry, SessionRecord, UpdateEntryArgs};
use crate::types::{OpTime, SessionId, Timestamp, WallTime};
use serde::Serialize;
use std::time::Duration;

/// Lock modes used by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intent shared.
    IntentShared,
    /// Intent exclusive.
    IntentExclusive,
    /// Shared.
    Shared,
    /// Exclusive.
    Exclusive,
}

impl LockMode {
    /// Canonical short name ("IS", "IX", "S", "X").
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        }
    }
}

/// Coarse activity state of a locker, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerClientState {
    /// No lock request in flight.
    Inactive,
    /// Actively acquiring or holding operation locks.
    Active,
}

/// One lock held by a locker, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    /// Resource the lock covers.
    pub resource: String,
    /// Mode string ("IS", "IX", "S", "X").
    pub mode: String,
}

/// Snapshot of a locker's held locks and aggregate wait statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockerInfo {
    /// Locks currently held.
    pub locks: Vec<HeldLock>,
    /// Total microseconds spent waiting on lock acquisition.
    pub total_wait_micros: u64,
}

/// Per-operation holder of lock-manager resources: execution ticket,
/// intent locks, and write-unit-of-work nesting.
///
/// Unlock requests made inside a write unit of work are deferred until
/// the unit ends (two-phase locking); implementations must honor that,
/// since the session layer relies on transaction locks surviving the
/// scope that acquired them.
pub trait Locker: Send {
    /// Acquire the global lock in `mode`, respecting the max lock
    /// timeout if armed.
    ///
    /// # Errors
    ///
    /// [`crate::Error::LockTimeout`] when the armed timeout elapses.
    fn lock_global(&mut self, mode: LockMode) -> Result<()>;

    /// Release the global lock; deferred when inside a write unit of
    /// work.
    fn unlock_global(&mut self);

    /// Whether any lock is currently held.
    fn is_locked(&self) -> bool;

    /// Give up the execution ticket while the operation is parked.
    fn release_ticket(&mut self);

    /// Reacquire an execution ticket; may block.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait is interrupted.
    fn reacquire_ticket(&mut self) -> Result<()>;

    /// Forget the owning thread; required before parking the locker in
    /// a stash slot.
    fn unset_thread_id(&mut self);

    /// Bind the locker to the calling thread after unstashing.
    fn rebind_to_current_thread(&mut self);

    /// Cap every future lock request at `timeout`.
    fn set_max_lock_timeout(&mut self, timeout: Duration);

    /// Remove the lock request cap.
    fn unset_max_lock_timeout(&mut self);

    /// The currently armed cap, if any.
    fn max_lock_timeout(&self) -> Option<Duration>;

    /// Enter a write-unit-of-work scope (nestable).
    fn begin_write_unit_of_work(&mut self);

    /// Leave a write-unit-of-work scope; at depth zero, performs the
    /// deferred unlocks.
    fn end_write_unit_of_work(&mut self);

    /// Whether the locker is inside a write unit of work.
    fn in_a_write_unit_of_work(&self) -> bool;

    /// Activity state for observers.
    fn client_state(&self) -> LockerClientState;

    /// Report held locks and wait stats; `None` when the locker has
    /// never acquired anything.
    fn locker_info(&self) -> Option<LockerInfo>;
}

/// Where the recovery unit's snapshot timestamp comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Storage engine default.
    Default,
    /// The replication subsystem's last-applied snapshot.
    LastApplied,
}

/// Callback registered to fire after a successful storage commit, with
/// the commit timestamp when one was set.
pub type CommitCallback = Box<dyn FnOnce(Option<Timestamp>) + Send>;

/// The storage engine's per-operation handle to a snapshot and its
/// pending changes.
pub trait RecoveryUnit: Send {
    /// Identity of the current snapshot; changes whenever the snapshot
    /// is abandoned or replaced.
    fn snapshot_id(&self) -> u64;

    /// Choose where the snapshot timestamp comes from. Must be called
    /// before the snapshot is allocated.
    fn set_timestamp_read_source(&mut self, source: ReadSource);

    /// Force snapshot allocation now, fixing the read timestamp.
    fn preallocate_snapshot(&mut self);

    /// The point-in-time read timestamp, once a snapshot exists.
    fn read_timestamp(&self) -> Option<Timestamp>;

    /// Start buffering writes.
    fn begin_unit_of_work(&mut self);

    /// Durably commit buffered writes and fire commit callbacks.
    ///
    /// # Errors
    ///
    /// Storage-level failures; buffered writes are discarded.
    fn commit_unit_of_work(&mut self) -> Result<()>;

    /// Discard buffered writes and registered callbacks.
    fn abort_unit_of_work(&mut self);

    /// Durably prepare buffered writes, assigning and returning the
    /// prepare timestamp.
    ///
    /// # Errors
    ///
    /// Storage-level failures.
    fn prepare_unit_of_work(&mut self) -> Result<Timestamp>;

    /// The assigned prepare timestamp, if prepared.
    fn prepare_timestamp(&self) -> Option<Timestamp>;

    /// Set the timestamp the next commit will be written at.
    fn set_commit_timestamp(&mut self, timestamp: Timestamp);

    /// The commit timestamp, if set.
    fn commit_timestamp(&self) -> Option<Timestamp>;

    /// Register a callback to run after a successful commit.
    fn on_commit(&mut self, callback: CommitCallback);
}

/// Factory for per-operation storage and lock resources.
pub trait StorageEngine: Send + Sync {
    /// A fresh recovery unit with no snapshot.
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit>;

    /// A fresh, empty locker.
    fn new_locker(&self) -> Box<dyn Locker>;
}

/// Extension point that writes oplog entries for transaction prepare
/// and commit.
///
/// Implementations may re-enter the session that invoked them (the
/// oplog write round-trips through the same session), so the session
/// never holds its mutex across these calls.
pub trait OpObserver: Send + Sync {
    /// A transaction on `op_ctx` is about to prepare.
    ///
    /// # Errors
    ///
    /// Failures abort the prepare.
    fn on_transaction_prepare(&self, op_ctx: &mut OperationContext) -> Result<()>;

    /// A transaction on `op_ctx` is committing.
    ///
    /// # Errors
    ///
    /// Failures abort the commit.
    fn on_transaction_commit(&self, op_ctx: &mut OperationContext, was_prepared: bool)
        -> Result<()>;
}

/// Read access to the replicated oplog.
pub trait OplogReader: Send + Sync {
    /// Fetch the entry at `op_time`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::IncompleteTransactionHistory`] when the entry has
    /// been truncated away.
    fn fetch(&self, op_time: OpTime) -> Result<OplogEntry>;
}

/// Opaque location of a row in the session-records collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u64);

/// Version marker of a stored document, used to detect mutation under a
/// snapshot.
pub type SnapshotVersion = u64;

/// The durable session-records collection, keyed by session id, with
/// `_id` as its sole index.
pub trait RecordStore: Send + Sync {
    /// Whether the collection exists at all. A missing collection is an
    /// unrecoverable deployment error.
    fn collection_exists(&self) -> bool;

    /// Whether the `_id` index exists.
    fn id_index_exists(&self) -> bool;

    /// Locate the row for `session_id` via the `_id` index.
    fn find_id(&self, session_id: &SessionId) -> Option<RecordId>;

    /// Read the row at `record_id` together with its version marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the row vanished.
    fn read(&self, record_id: &RecordId) -> Result<(SessionRecord, SnapshotVersion)>;

    /// Insert a fresh row.
    ///
    /// # Errors
    ///
    /// [`crate::Error::DuplicateKey`] when a row with the same id
    /// appeared concurrently.
    fn insert(&self, record: SessionRecord) -> Result<()>;

    /// Replace the row at `record_id` in place.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WriteConflict`] when the row's version no longer
    /// equals `expected`.
    fn update(
        &self,
        record_id: &RecordId,
        expected: SnapshotVersion,
        record: SessionRecord,
        args: &UpdateEntryArgs,
    ) -> Result<()>;
}

/// The replication subsystem, reduced to what the session layer needs.
pub trait ReplicationCoordinator: Send + Sync {
    /// Current replication term.
    fn term(&self) -> i64;
}

/// Wall-clock and microsecond time source. Tests substitute a manually
/// advanced clock.
pub trait ClockSource: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> WallTime;

    /// Current time in microseconds, for duration accounting.
    fn now_micros(&self) -> u64;
}
