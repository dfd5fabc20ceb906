//! Upsert behavior of the session-record writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vellum_core::context::ServiceContext;
use vellum_core::error::Result;
use vellum_core::record::{SessionRecord, UpdateEntryArgs, SESSION_RECORDS_COLLECTION};
use vellum_core::testing::{
    ManualClock, MemOplog, MemRecordStore, MemReplCoordinator, MemStorageEngine,
    RecordingOpObserver, TestHarness,
};
use vellum_core::traits::{RecordId, RecordStore, SnapshotVersion};
use vellum_core::types::{OpTime, SessionId, Timestamp, WallTime};
use vellum_durability::writer::{matching_transaction_table_update, update_session_entry};

fn record(session_id: SessionId, txn_num: i64, ts: u64) -> SessionRecord {
    SessionRecord {
        session_id,
        txn_num,
        last_write_op_time: OpTime::new(Timestamp(ts), 1),
        last_write_date: WallTime::from_millis(1_600_000_000_000),
    }
}

#[test]
fn test_insert_path_creates_row() {
    let harness = TestHarness::new();
    let client = harness.new_client("writer");
    let mut op_ctx = harness.new_operation(&client);
    let session_id = SessionId::new();

    update_session_entry(&mut op_ctx, record(session_id, 3, 10)).unwrap();

    let stored = harness.records.get(&session_id).unwrap();
    assert_eq!(stored.txn_num, 3);
    assert_eq!(stored.last_write_op_time, OpTime::new(Timestamp(10), 1));
}

#[test]
fn test_update_path_replaces_row_in_place() {
    let harness = TestHarness::new();
    let client = harness.new_client("writer");
    let mut op_ctx = harness.new_operation(&client);
    let session_id = SessionId::new();

    update_session_entry(&mut op_ctx, record(session_id, 3, 10)).unwrap();
    update_session_entry(&mut op_ctx, record(session_id, 4, 25)).unwrap();

    let stored = harness.records.get(&session_id).unwrap();
    assert_eq!(stored.txn_num, 4);
    assert_eq!(stored.last_write_op_time, OpTime::new(Timestamp(25), 1));

    let args = harness.records.last_update_args().unwrap();
    assert_eq!(args.namespace, SESSION_RECORDS_COLLECTION);
    assert_eq!(args.criteria_id, session_id);
    assert!(!args.from_migrate);
}

#[test]
#[should_panic(expected = "40527")]
fn test_missing_collection_is_fatal() {
    let harness = TestHarness::new();
    let client = harness.new_client("writer");
    let mut op_ctx = harness.new_operation(&client);

    harness.records.set_collection_exists(false);
    let _ = update_session_entry(&mut op_ctx, record(SessionId::new(), 1, 1));
}

/// Record store that simulates the two racing shapes the writer must
/// convert into write conflicts.
struct RacingStore {
    inner: Arc<MemRecordStore>,
    hide_row_once: AtomicBool,
    conflict_update_once: AtomicBool,
}

impl RacingStore {
    fn new(inner: Arc<MemRecordStore>) -> Arc<Self> {
        Arc::new(RacingStore {
            inner,
            hide_row_once: AtomicBool::new(false),
            conflict_update_once: AtomicBool::new(false),
        })
    }
}

impl RecordStore for RacingStore {
    fn collection_exists(&self) -> bool {
        self.inner.collection_exists()
    }

    fn id_index_exists(&self) -> bool {
        self.inner.id_index_exists()
    }

    fn find_id(&self, session_id: &SessionId) -> Option<RecordId> {
        if self.hide_row_once.swap(false, Ordering::Relaxed) {
            // The lookup misses, then the insert collides: a concurrent
            // writer created the row in between.
            return None;
        }
        self.inner.find_id(session_id)
    }

    fn read(&self, record_id: &RecordId) -> Result<(SessionRecord, SnapshotVersion)> {
        self.inner.read(record_id)
    }

    fn insert(&self, record: SessionRecord) -> Result<()> {
        self.inner.insert(record)
    }

    fn update(
        &self,
        record_id: &RecordId,
        expected: SnapshotVersion,
        record: SessionRecord,
        args: &UpdateEntryArgs,
    ) -> Result<()> {
        if self.conflict_update_once.swap(false, Ordering::Relaxed) {
            // The document moved under the snapshot.
            return self.inner.update(record_id, expected + 1, record, args);
        }
        self.inner.update(record_id, expected, record, args)
    }
}

fn service_with_store(store: Arc<RacingStore>) -> (Arc<ServiceContext>, Arc<MemStorageEngine>) {
    let storage = MemStorageEngine::new();
    let service = ServiceContext::new(
        storage.clone(),
        RecordingOpObserver::new(),
        MemOplog::new(),
        store,
        MemReplCoordinator::new(),
        ManualClock::new(),
    );
    (service, storage)
}

#[test]
fn test_duplicate_key_surfaces_as_write_conflict() {
    let inner = MemRecordStore::new();
    let store = RacingStore::new(inner.clone());
    let session_id = SessionId::new();

    inner.insert(record(session_id, 1, 5)).unwrap();
    store.hide_row_once.store(true, Ordering::Relaxed);

    let (service, _storage) = service_with_store(store);
    let client = vellum_core::context::Client::new(
        "writer",
        "127.0.0.1:27017",
        1,
        "test-app",
        serde_json::json!({}),
    );
    let mut op_ctx = vellum_core::context::OperationContext::new(&service, &client);

    let err = update_session_entry(&mut op_ctx, record(session_id, 2, 9)).unwrap_err();
    assert!(err.is_write_conflict(), "got: {err}");
}

#[test]
fn test_mutated_row_surfaces_as_write_conflict() {
    let inner = MemRecordStore::new();
    let store = RacingStore::new(inner.clone());
    let session_id = SessionId::new();

    inner.insert(record(session_id, 1, 5)).unwrap();
    store.conflict_update_once.store(true, Ordering::Relaxed);

    let (service, _storage) = service_with_store(store);
    let client = vellum_core::context::Client::new(
        "writer",
        "127.0.0.1:27017",
        1,
        "test-app",
        serde_json::json!({}),
    );
    let mut op_ctx = vellum_core::context::OperationContext::new(&service, &client);

    let err = update_session_entry(&mut op_ctx, record(session_id, 2, 9)).unwrap_err();
    assert!(err.is_write_conflict(), "got: {err}");

    // A retry under a fresh snapshot succeeds.
    update_session_entry(&mut op_ctx, record(session_id, 2, 9)).unwrap();
    assert_eq!(inner.get(&session_id).unwrap().txn_num, 2);
}

#[test]
fn test_matching_transaction_table_update_mirrors_entry() {
    let session_id = SessionId::new();
    let entry = vellum_core::testing::write_entry(
        session_id,
        11,
        0,
        OpTime::new(Timestamp(50), 2),
        None,
    );

    let update = matching_transaction_table_update(&entry).unwrap();
    assert_eq!(update.op_time, entry.op_time);
    assert_eq!(update.session_id, session_id);
    assert_eq!(update.txn_number, Some(11));
    assert!(update.stmt_id.is_none());

    let mut bare = entry;
    bare.txn_number = None;
    assert!(matching_transaction_table_update(&bare).is_none());
}

#[test]
fn test_write_conflict_on_duplicate_insert_direct() {
    let store = MemRecordStore::new();
    let session_id = SessionId::new();
    store.insert(record(session_id, 1, 5)).unwrap();
    let err = store.insert(record(session_id, 1, 5)).unwrap_err();
    assert!(err.is_duplicate_key());
}

#[test]
fn test_stale_version_update_conflicts_direct() {
    let store = MemRecordStore::new();
    let session_id = SessionId::new();
    store.insert(record(session_id, 1, 5)).unwrap();

    let record_id = store.find_id(&session_id).unwrap();
    let (_, version) = store.read(&record_id).unwrap();
    store.touch(&session_id);

    let args = UpdateEntryArgs {
        namespace: SESSION_RECORDS_COLLECTION.to_string(),
        criteria_id: session_id,
        from_migrate: false,
    };
    let err = store
        .update(&record_id, version, record(session_id, 2, 9), &args)
        .unwrap_err();
    assert!(err.is_write_conflict());
}
