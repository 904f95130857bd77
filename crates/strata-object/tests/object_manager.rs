use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{NodeId, ObjectId};
use strata_object::{
    LookupRequest, ManagedObject, ManagedObjectState, ObjectManager, ObjectManagerConfig,
    ObjectStateFactory, ServerContext, WaitForLookup,
};
use strata_store::InMemoryObjectStore;

/// Minimal graph-shaped object state: a list of outbound references.
struct GraphState {
    references: Vec<ObjectId>,
}

impl ManagedObjectState for GraphState {
    fn type_name(&self) -> &str {
        "graph"
    }

    fn reachable_ids(&self) -> Vec<ObjectId> {
        self.references.clone()
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.references.len() * 8);
        for id in &self.references {
            out.extend_from_slice(&id.raw().to_le_bytes());
        }
        out
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct GraphFactory;

impl ObjectStateFactory for GraphFactory {
    fn new_state(&self, _id: ObjectId) -> Box<dyn ManagedObjectState> {
        Box::new(GraphState {
            references: Vec::new(),
        })
    }

    fn decode(
        &self,
        _type_name: &str,
        payload: &[u8],
    ) -> Result<Box<dyn ManagedObjectState>, strata_object::ObjectManagerError> {
        let references = payload
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                ObjectId::new(i64::from_le_bytes(raw))
            })
            .collect();
        Ok(Box::new(GraphState { references }))
    }
}

fn new_manager() -> Arc<ObjectManager> {
    let context = Arc::new(ServerContext {
        node_id: NodeId::new(1),
        state_factory: Arc::new(GraphFactory),
    });
    let config = ObjectManagerConfig {
        gc_wait_warn_interval: Duration::from_millis(100),
        ..ObjectManagerConfig::default()
    };
    Arc::new(ObjectManager::new(
        context,
        Arc::new(InMemoryObjectStore::new()),
        config,
    ))
}

/// Creates an object with the given outbound references and releases it,
/// committing it to the store.
fn put_object(manager: &ObjectManager, id: ObjectId, references: Vec<ObjectId>) {
    manager.create_new_objects(&BTreeSet::from([id]));
    let request = LookupRequest::read_write([id]).with_new_object_ids([id]);
    let responder = Arc::new(WaitForLookup::new());
    assert!(manager.lookup_objects_for(NodeId::new(1), request, responder.clone()));
    let mut results = responder.wait();
    let mut object = results.take_object(id).unwrap();
    object
        .state_mut()
        .as_any_mut()
        .downcast_mut::<GraphState>()
        .unwrap()
        .references = references;
    manager.release(object);
}

#[test]
fn checkout_is_exclusive_until_release() {
    let manager = new_manager();
    let id = ObjectId::new(1);
    put_object(&manager, id, vec![]);

    let held = manager.get_object_by_id(id);
    assert!(manager.is_referenced(id));
    assert_eq!(manager.checked_out_count(), 1);

    // A second lookup parks instead of delivering.
    let responder = Arc::new(WaitForLookup::new());
    let delivered = manager.lookup_objects_for(
        NodeId::new(2),
        LookupRequest::read_write([id]),
        responder.clone(),
    );
    assert!(!delivered);
    assert!(responder.wait_for(Duration::from_millis(50)).is_none());

    // Release wakes the parked request.
    manager.release(held);
    let mut results = responder
        .wait_for(Duration::from_secs(5))
        .expect("parked lookup should complete after release");
    let object = results.take_object(id).unwrap();
    manager.release(object);
    assert_eq!(manager.checked_out_count(), 0);
}

#[test]
fn checkout_count_balances_across_release() {
    let manager = new_manager();
    for raw in 1..=3 {
        put_object(&manager, ObjectId::new(raw), vec![]);
    }
    assert_eq!(manager.checked_out_count(), 0);

    let objects: Vec<ManagedObject> = (1..=3)
        .map(|raw| manager.get_object_by_id(ObjectId::new(raw)))
        .collect();
    assert_eq!(manager.checked_out_count(), 3);

    manager.release_all(objects);
    assert_eq!(manager.checked_out_count(), 0);
}

#[test]
fn release_of_unknown_object_is_fatal() {
    let manager = new_manager();
    let stray = ManagedObject::new_object(
        ObjectId::new(99),
        Box::new(GraphState {
            references: Vec::new(),
        }),
    );
    let result = std::thread::spawn(move || manager.release_read_only(stray)).join();
    assert!(result.is_err());
}

#[test]
fn overlapping_multi_object_checkouts_do_not_deadlock() {
    let manager = new_manager();
    let a = ObjectId::new(1);
    let b = ObjectId::new(2);
    put_object(&manager, a, vec![]);
    put_object(&manager, b, vec![]);

    let mut handles = Vec::new();
    for order in [[a, b], [b, a]] {
        let manager = manager.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..200 {
                let responder = Arc::new(WaitForLookup::new());
                // The request set sorts ids internally; opposite
                // declaration orders still acquire in one global order.
                manager.lookup_objects_for(
                    NodeId::new(order[0].raw() as u64),
                    LookupRequest::read_write(order),
                    responder.clone(),
                );
                let results = responder.wait();
                assert_eq!(results.objects.len(), 2);
                manager.release_all(results.objects);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("checkout worker should finish");
    }
    assert_eq!(manager.checked_out_count(), 0);
}

#[test]
fn new_objects_are_invisible_to_unrelated_lookups() {
    let manager = new_manager();
    let id = ObjectId::new(7);
    manager.create_new_objects(&BTreeSet::from([id]));

    // A lookup that did not declare the id as new parks.
    let responder = Arc::new(WaitForLookup::new());
    let delivered = manager.lookup_objects_for(
        NodeId::new(2),
        LookupRequest::read_write([id]),
        responder.clone(),
    );
    assert!(!delivered);

    // The creator sees it, applies state, releases: now visible.
    let creator = Arc::new(WaitForLookup::new());
    assert!(manager.lookup_objects_for(
        NodeId::new(1),
        LookupRequest::read_write([id]).with_new_object_ids([id]),
        creator.clone(),
    ));
    let mut results = creator.wait();
    manager.release(results.take_object(id).unwrap());

    let mut woken = responder
        .wait_for(Duration::from_secs(5))
        .expect("lookup should complete once the object is applied");
    manager.release(woken.take_object(id).unwrap());
}

#[test]
fn missing_objects_are_recorded_not_fatal() {
    let manager = new_manager();
    put_object(&manager, ObjectId::new(1), vec![]);

    let responder = Arc::new(WaitForLookup::new());
    let delivered = manager.lookup_objects_for(
        NodeId::new(1),
        LookupRequest::read_write([ObjectId::new(1), ObjectId::new(404)]),
        responder.clone(),
    );
    assert!(delivered);
    let mut results = responder.wait();
    assert_eq!(
        results.missing_object_ids,
        BTreeSet::from([ObjectId::new(404)])
    );
    manager.release(results.take_object(ObjectId::new(1)).unwrap());

    assert!(manager.try_get_object_read_only(ObjectId::new(404)).is_none());
}

#[test]
fn reachability_expansion_checks_out_resident_subobjects() {
    let manager = new_manager();
    let leaf1 = ObjectId::new(11);
    let leaf2 = ObjectId::new(12);
    let root = ObjectId::new(1);
    put_object(&manager, leaf1, vec![]);
    put_object(&manager, leaf2, vec![]);
    put_object(&manager, root, vec![leaf1, leaf2]);

    let responder = Arc::new(WaitForLookup::new());
    assert!(manager.lookup_objects_and_subobjects_for(
        NodeId::new(1),
        LookupRequest::read_write([root]),
        responder.clone(),
        10,
    ));
    let results = responder.wait();
    let ids: BTreeSet<ObjectId> = results.objects.iter().map(|o| o.id()).collect();
    assert_eq!(ids, BTreeSet::from([root, leaf1, leaf2]));
    assert_eq!(manager.checked_out_count(), 3);
    manager.release_all(results.objects);
}

#[test]
fn expansion_skips_checked_out_subobjects() {
    let manager = new_manager();
    let leaf = ObjectId::new(11);
    let root = ObjectId::new(1);
    put_object(&manager, leaf, vec![]);
    put_object(&manager, root, vec![leaf]);

    let held = manager.get_object_by_id(leaf);

    let responder = Arc::new(WaitForLookup::new());
    assert!(manager.lookup_objects_and_subobjects_for(
        NodeId::new(1),
        LookupRequest::read_write([root]),
        responder.clone(),
        10,
    ));
    let results = responder.wait();
    let ids: BTreeSet<ObjectId> = results.objects.iter().map(|o| o.id()).collect();
    // The expansion is opportunistic: a contended subobject is skipped,
    // never blocked on.
    assert_eq!(ids, BTreeSet::from([root]));
    manager.release_all(results.objects);
    manager.release(held);
}

#[test]
fn try_delete_defers_checked_out_objects() {
    let manager = new_manager();
    let a = ObjectId::new(1);
    let b = ObjectId::new(2);
    put_object(&manager, a, vec![]);
    put_object(&manager, b, vec![]);

    let held = manager.get_object_by_id(a);
    let retry = manager
        .try_delete_objects(&BTreeSet::from([a, b]))
        .unwrap();
    assert_eq!(retry, BTreeSet::from([a]));
    assert!(!manager.store().contains_object(b));
    assert!(manager.store().contains_object(a));

    manager.release(held);
    let retry = manager.try_delete_objects(&retry).unwrap();
    assert!(retry.is_empty());
    assert!(!manager.store().contains_object(a));
}

#[test]
fn roots_are_durable_and_resolvable() {
    let manager = new_manager();
    let id = ObjectId::new(5);
    put_object(&manager, id, vec![]);
    manager.create_root("customers", id).unwrap();

    assert_eq!(manager.lookup_root_id("customers"), Some(id));
    assert_eq!(manager.lookup_root_id("absent"), None);
    assert_eq!(manager.root_names(), vec!["customers".to_string()]);
}

#[test]
fn stop_flushes_resident_objects() {
    let manager = new_manager();
    let id = ObjectId::new(1);
    put_object(&manager, id, vec![]);

    manager.stop().unwrap();
    assert!(manager.store().contains_object(id));

    let manager2 = manager.clone();
    let result = std::thread::spawn(move || {
        manager2.create_new_objects(&BTreeSet::from([ObjectId::new(2)]));
    })
    .join();
    assert!(result.is_err(), "operations after stop are fatal");
}

#[test]
fn dirty_read_only_release_is_fatal() {
    let manager = new_manager();
    let id = ObjectId::new(1);
    put_object(&manager, id, vec![]);

    let manager2 = manager.clone();
    let result = std::thread::spawn(move || {
        let mut object = manager2.get_object_by_id_read_only(id);
        object
            .state_mut()
            .as_any_mut()
            .downcast_mut::<GraphState>()
            .unwrap()
            .references = vec![ObjectId::new(2)];
        manager2.release_read_only(object);
    })
    .join();
    assert!(result.is_err());
}
