use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strata_core::ObjectId;

use crate::StoreError;

/// Serialized state of one managed object as the store sees it.
///
/// The object manager owns encoding/decoding; the store only moves bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: ObjectId,
    pub version: u64,
    pub type_name: String,
    /// Server maps are enumerable for the periodic evictor.
    pub evictable: bool,
    pub payload: Vec<u8>,
}

/// A unit of durable work. `commit` is the durability point; dropping a
/// transaction without committing discards its writes.
pub trait Transaction: Send {
    fn save_object(&mut self, object: StoredObject);
    fn save_all_objects(&mut self, objects: Vec<StoredObject>);
    fn save_root(&mut self, name: &str, id: ObjectId);
    fn delete_objects(&mut self, ids: &BTreeSet<ObjectId>);
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable key-value storage of serialized object state, indexed by
/// object id, plus the root name↔id mapping.
///
/// All mutation goes through [`Transaction`]s obtained from `begin`.
pub trait ObjectStore: Send + Sync {
    fn begin(&self) -> Box<dyn Transaction>;

    fn load_object(&self, id: ObjectId) -> Result<Option<StoredObject>, StoreError>;
    fn contains_object(&self, id: ObjectId) -> bool;
    fn object_count(&self) -> usize;

    fn root_id(&self, name: &str) -> Option<ObjectId>;
    fn roots(&self) -> BTreeMap<String, ObjectId>;

    fn snapshot_object_ids(&self) -> BTreeSet<ObjectId>;
    fn snapshot_evictable_object_ids(&self) -> BTreeSet<ObjectId>;
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<ObjectId, StoredObject>,
    roots: BTreeMap<String, ObjectId>,
}

/// In-memory reference implementation of [`ObjectStore`].
///
/// Exists so the core is testable end to end; a production deployment
/// plugs a real storage engine in behind the same trait.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Op {
    SaveObject(StoredObject),
    SaveRoot(String, ObjectId),
    DeleteObjects(BTreeSet<ObjectId>),
}

struct InMemoryTransaction {
    state: Arc<RwLock<StoreState>>,
    ops: Vec<Op>,
}

impl Transaction for InMemoryTransaction {
    fn save_object(&mut self, object: StoredObject) {
        self.ops.push(Op::SaveObject(object));
    }

    fn save_all_objects(&mut self, objects: Vec<StoredObject>) {
        self.ops.extend(objects.into_iter().map(Op::SaveObject));
    }

    fn save_root(&mut self, name: &str, id: ObjectId) {
        self.ops.push(Op::SaveRoot(name.to_string(), id));
    }

    fn delete_objects(&mut self, ids: &BTreeSet<ObjectId>) {
        self.ops.push(Op::DeleteObjects(ids.clone()));
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for op in self.ops {
            match op {
                Op::SaveObject(object) => {
                    state.objects.insert(object.id, object);
                }
                Op::SaveRoot(name, id) => {
                    state.roots.insert(name, id);
                }
                Op::DeleteObjects(ids) => {
                    for id in &ids {
                        state.objects.remove(id);
                    }
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn begin(&self) -> Box<dyn Transaction> {
        Box::new(InMemoryTransaction {
            state: self.state.clone(),
            ops: Vec::new(),
        })
    }

    fn load_object(&self, id: ObjectId) -> Result<Option<StoredObject>, StoreError> {
        Ok(self.state.read().objects.get(&id).cloned())
    }

    fn contains_object(&self, id: ObjectId) -> bool {
        self.state.read().objects.contains_key(&id)
    }

    fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    fn root_id(&self, name: &str) -> Option<ObjectId> {
        self.state.read().roots.get(name).copied()
    }

    fn roots(&self) -> BTreeMap<String, ObjectId> {
        self.state.read().roots.clone()
    }

    fn snapshot_object_ids(&self) -> BTreeSet<ObjectId> {
        self.state.read().objects.keys().copied().collect()
    }

    fn snapshot_evictable_object_ids(&self) -> BTreeSet<ObjectId> {
        self.state
            .read()
            .objects
            .values()
            .filter(|o| o.evictable)
            .map(|o| o.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: i64, evictable: bool) -> StoredObject {
        StoredObject {
            id: ObjectId::new(id),
            version: 1,
            type_name: "test".to_string(),
            evictable,
            payload: vec![id as u8],
        }
    }

    #[test]
    fn uncommitted_transaction_writes_nothing() {
        let store = InMemoryObjectStore::new();
        let mut tx = store.begin();
        tx.save_object(stored(1, false));
        drop(tx);
        assert!(!store.contains_object(ObjectId::new(1)));
    }

    #[test]
    fn commit_is_the_durability_point() {
        let store = InMemoryObjectStore::new();
        let mut tx = store.begin();
        tx.save_object(stored(1, false));
        tx.save_object(stored(2, true));
        tx.save_root("root", ObjectId::new(1));
        tx.commit().unwrap();

        assert_eq!(store.object_count(), 2);
        assert_eq!(store.root_id("root"), Some(ObjectId::new(1)));
        assert_eq!(
            store.snapshot_evictable_object_ids(),
            BTreeSet::from([ObjectId::new(2)])
        );
    }

    #[test]
    fn delete_removes_objects_but_not_roots() {
        let store = InMemoryObjectStore::new();
        let mut tx = store.begin();
        tx.save_object(stored(1, false));
        tx.save_root("root", ObjectId::new(1));
        tx.commit().unwrap();

        let mut tx = store.begin();
        tx.delete_objects(&BTreeSet::from([ObjectId::new(1)]));
        tx.commit().unwrap();

        assert!(!store.contains_object(ObjectId::new(1)));
        assert_eq!(store.root_id("root"), Some(ObjectId::new(1)));
    }
}
