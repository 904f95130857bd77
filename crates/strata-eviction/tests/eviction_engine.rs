use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_core::{unix_seconds, NodeId, ObjectId};
use strata_eviction::{
    CacheEntryState, CapacityEvictionTrigger, EvictionEngine, EvictionEngineConfig,
    NoClientReferences, ServerMapEvictionTransaction, ServerMapState, TransactionBatchSink,
};
use strata_object::{
    ManagedObjectState, ObjectManager, ObjectManagerConfig, ObjectManagerError,
    ObjectStateFactory, ServerContext,
};
use strata_store::{EvictionRecord, InMemoryObjectStore, RecoveryLog, StoredObject};

struct CacheStateFactory;

impl ObjectStateFactory for CacheStateFactory {
    fn new_state(&self, _id: ObjectId) -> Box<dyn ManagedObjectState> {
        Box::new(CacheEntryState::new(unix_seconds()))
    }

    fn decode(
        &self,
        type_name: &str,
        payload: &[u8],
    ) -> Result<Box<dyn ManagedObjectState>, ObjectManagerError> {
        match type_name {
            "server-map" => ServerMapState::decode(payload)
                .map(|state| Box::new(state) as Box<dyn ManagedObjectState>)
                .map_err(|err| ObjectManagerError::Decode {
                    id: ObjectId::NULL,
                    type_name: type_name.to_string(),
                    detail: err.to_string(),
                }),
            "cache-entry" => CacheEntryState::decode(payload)
                .map(|state| Box::new(state) as Box<dyn ManagedObjectState>)
                .map_err(|err| ObjectManagerError::Decode {
                    id: ObjectId::NULL,
                    type_name: type_name.to_string(),
                    detail: err.to_string(),
                }),
            other => Err(ObjectManagerError::UnknownStateType(other.to_string())),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    transactions: Mutex<Vec<ServerMapEvictionTransaction>>,
}

impl TransactionBatchSink for RecordingSink {
    fn submit(&self, transaction: &ServerMapEvictionTransaction) {
        self.transactions.lock().push(transaction.clone());
    }
}

struct Harness {
    manager: Arc<ObjectManager>,
    engine: Arc<EvictionEngine>,
    sink: Arc<RecordingSink>,
    log: Arc<RecoveryLog>,
    _dir: tempfile::TempDir,
}

fn new_harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(RecoveryLog::open(dir.path().join("recovery.bin")).unwrap());
    let context = Arc::new(ServerContext {
        node_id: NodeId::new(1),
        state_factory: Arc::new(CacheStateFactory),
    });
    let manager = Arc::new(ObjectManager::new(
        context,
        Arc::new(InMemoryObjectStore::new()),
        ObjectManagerConfig::default(),
    ));
    let sink = Arc::new(RecordingSink::default());
    let engine = Arc::new(EvictionEngine::new(
        manager.clone(),
        Arc::new(NoClientReferences),
        sink.clone(),
        log.clone(),
        EvictionEngineConfig {
            evictor_sleep: Duration::from_secs(3600),
            queue_capacity: 16,
        },
    ));
    engine.start();
    Harness {
        manager,
        engine,
        sink,
        log,
        _dir: dir,
    }
}

/// Commits a server map with `live` fresh entries and `expired` entries
/// whose TTL has long passed. Entry value objects get ids starting at
/// `map_id * 1000`.
fn put_map(
    harness: &Harness,
    map_id: ObjectId,
    max_total_count: usize,
    ttl_seconds: i64,
    live: usize,
    expired: usize,
) {
    let now = unix_seconds();
    let mut map = ServerMapState::new(format!("cache-{map_id}"), max_total_count, 0, ttl_seconds);
    let mut tx = harness.manager.store().begin();
    let base = map_id.raw() * 1000;
    for i in 0..(live + expired) {
        let entry_id = ObjectId::new(base + i as i64);
        let created_at = if i < expired {
            now - ttl_seconds.max(1) - 60
        } else {
            now
        };
        let entry = CacheEntryState::new(created_at);
        tx.save_object(StoredObject {
            id: entry_id,
            version: 1,
            type_name: "cache-entry".to_string(),
            evictable: false,
            payload: entry.encode(),
        });
        map.insert(format!("k{i:04}"), entry_id);
    }
    tx.save_object(StoredObject {
        id: map_id,
        version: 1,
        type_name: "server-map".to_string(),
        evictable: true,
        payload: map.encode(),
    });
    tx.commit().unwrap();
}

fn map_size(harness: &Harness, map_id: ObjectId) -> usize {
    let object = harness.manager.get_object_by_id_read_only(map_id);
    let size = object.state().as_evictable().unwrap().size();
    harness.manager.release_read_only(object);
    size
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn capacity_eviction_removes_the_overshoot_transactionally() {
    let harness = new_harness();
    let map_id = ObjectId::new(1);
    put_map(&harness, map_id, 100, 0, 130, 0);

    let mut trigger = CapacityEvictionTrigger::new();
    assert!(harness.engine.evict_on(map_id, &mut trigger).unwrap());

    wait_until("eviction transaction to apply", || {
        !harness.engine.is_evicting(map_id)
    });

    assert_eq!(map_size(&harness, map_id), 100);
    let transactions = harness.sink.transactions.lock();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].object_id, map_id);
    assert_eq!(transactions[0].keys.len(), 30);
    // In-flight record cleared on completion; a new pass may start.
    assert!(harness.log.in_flight_evictions().is_empty());
}

#[test]
fn under_capacity_map_produces_no_transaction() {
    let harness = new_harness();
    let map_id = ObjectId::new(1);
    put_map(&harness, map_id, 100, 0, 50, 0);

    let mut trigger = CapacityEvictionTrigger::new();
    assert!(!harness.engine.evict_on(map_id, &mut trigger).unwrap());

    assert!(harness.sink.transactions.lock().is_empty());
    assert!(!harness.engine.is_evicting(map_id));
    // The evicting flag cleared exactly once: a second attempt can claim.
    let object = harness.manager.get_object_by_id_read_only(map_id);
    assert!(!object.state().as_evictable().unwrap().is_evicting());
    harness.manager.release_read_only(object);
}

#[test]
fn deleted_map_is_tolerated() {
    let harness = new_harness();
    let mut trigger = CapacityEvictionTrigger::new();
    assert!(!harness.engine.evict_on(ObjectId::new(404), &mut trigger).unwrap());
    assert!(harness.sink.transactions.lock().is_empty());
}

#[test]
fn periodic_sweep_evicts_expired_entries() {
    let harness = new_harness();
    let map_id = ObjectId::new(2);
    // 20 live + 10 expired, well under capacity: only the expired ones go.
    put_map(&harness, map_id, 1000, 60, 20, 10);

    harness.engine.run_evictor();
    wait_until("periodic eviction to apply", || {
        !harness.engine.is_evicting(map_id)
    });

    assert_eq!(map_size(&harness, map_id), 20);
    let transactions = harness.sink.transactions.lock();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].keys.len(), 10);
}

#[test]
fn eternal_in_bounds_map_survives_the_periodic_sweep() {
    let harness = new_harness();
    let map_id = ObjectId::new(3);
    put_map(&harness, map_id, 1000, 0, 50, 0);

    harness.engine.run_evictor();
    assert_eq!(map_size(&harness, map_id), 50);
    assert!(harness.sink.transactions.lock().is_empty());
}

#[test]
fn persisted_in_flight_eviction_is_resubmitted_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recovery.bin");
    let map_id = ObjectId::new(42);

    // A previous process persisted the record but crashed before the
    // removal completed.
    {
        let log = RecoveryLog::open(&path).unwrap();
        log.record_eviction(EvictionRecord {
            object_id: map_id,
            cache_name: "cache-42".to_string(),
            candidate_keys: vec!["k0000".to_string(), "k0001".to_string()],
        })
        .unwrap();
    }

    let log = Arc::new(RecoveryLog::open(&path).unwrap());
    let context = Arc::new(ServerContext {
        node_id: NodeId::new(1),
        state_factory: Arc::new(CacheStateFactory),
    });
    let manager = Arc::new(ObjectManager::new(
        context,
        Arc::new(InMemoryObjectStore::new()),
        ObjectManagerConfig::default(),
    ));
    let sink = Arc::new(RecordingSink::default());
    let engine = Arc::new(EvictionEngine::new(
        manager.clone(),
        Arc::new(NoClientReferences),
        sink.clone(),
        log.clone(),
        EvictionEngineConfig::default(),
    ));

    // The map exists with both sampled keys still present.
    let mut map = ServerMapState::new("cache-42", 100, 0, 0);
    map.insert("k0000", ObjectId::new(1000));
    map.insert("k0001", ObjectId::new(1001));
    map.insert("k0002", ObjectId::new(1002));
    let mut tx = manager.store().begin();
    tx.save_object(StoredObject {
        id: map_id,
        version: 1,
        type_name: "server-map".to_string(),
        evictable: true,
        payload: map.encode(),
    });
    tx.commit().unwrap();

    engine.start();
    engine.recover();

    wait_until("recovered eviction to apply", || {
        log.in_flight_evictions().is_empty() && !engine.is_evicting(map_id)
    });

    let transactions = sink.transactions.lock();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].object_id, map_id);

    let object = manager.get_object_by_id_read_only(map_id);
    let state = object.state().as_evictable().unwrap();
    assert_eq!(state.size(), 1);
    assert!(!state.is_evicting());
    manager.release_read_only(object);
}

#[test]
fn second_pass_is_skipped_while_one_is_in_flight() {
    let harness = new_harness();
    let map_id = ObjectId::new(5);
    put_map(&harness, map_id, 100, 0, 130, 0);

    let mut first = CapacityEvictionTrigger::new();
    assert!(harness.engine.evict_on(map_id, &mut first).unwrap());
    // Whether or not the worker has already applied the removal, a
    // back-to-back second pass finds either the in-progress mark or a
    // map back under capacity: no second transaction appears.
    let mut second = CapacityEvictionTrigger::new();
    let _ = harness.engine.evict_on(map_id, &mut second).unwrap();

    wait_until("eviction transaction to apply", || {
        !harness.engine.is_evicting(map_id)
    });
    assert_eq!(harness.sink.transactions.lock().len(), 1);

    // Cleanup delete: the evicted map can be deleted outright.
    let retry = harness
        .manager
        .try_delete_objects(&BTreeSet::from([map_id]))
        .unwrap();
    assert!(retry.is_empty());
    assert!(!harness.manager.store().contains_object(map_id));
}
