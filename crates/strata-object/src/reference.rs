use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use strata_core::ObjectId;

use crate::object::ManagedObject;

/// Explicit checkout state of a reference-table entry, mutated only via
/// compare-and-swap transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckoutState {
    Free = 0,
    CheckedOut = 1,
    CheckedOutRemoveOnRelease = 2,
}

impl CheckoutState {
    fn from_raw(raw: u8) -> CheckoutState {
        match raw {
            0 => CheckoutState::Free,
            1 => CheckoutState::CheckedOut,
            2 => CheckoutState::CheckedOutRemoveOnRelease,
            other => panic!("invalid checkout state {other}"),
        }
    }
}

/// A table entry correlating an object id to its (possibly checked-out)
/// managed object.
///
/// The body is `Some` while the object is parked in the table and `None`
/// while a checkout holds it. `is_new` rides on the entry so lookups can
/// test visibility without touching the body.
pub struct ObjectReference {
    id: ObjectId,
    state: AtomicU8,
    is_new: AtomicBool,
    body: Mutex<Option<ManagedObject>>,
}

impl ObjectReference {
    pub fn new(id: ObjectId, object: ManagedObject) -> Self {
        let is_new = object.is_new();
        Self {
            id,
            state: AtomicU8::new(CheckoutState::Free as u8),
            is_new: AtomicBool::new(is_new),
            body: Mutex::new(Some(object)),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn checkout_state(&self) -> CheckoutState {
        CheckoutState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_referenced(&self) -> bool {
        self.checkout_state() != CheckoutState::Free
    }

    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub fn clear_new(&self) {
        self.is_new.store(false, Ordering::Release);
    }

    /// Atomically claims the checkout mark. Returns false if the entry is
    /// already checked out.
    pub fn mark_referenced(&self, remove_on_release: bool) -> bool {
        let target = if remove_on_release {
            CheckoutState::CheckedOutRemoveOnRelease
        } else {
            CheckoutState::CheckedOut
        };
        self.state
            .compare_exchange(
                CheckoutState::Free as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Releases the checkout mark, reporting whether the entry was
    /// checked out with remove-on-release. Returns `Err(())` if the entry
    /// was not checked out — the caller treats that as a fatal invariant
    /// violation.
    pub fn unmark_referenced(&self) -> Result<bool, ()> {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let state = CheckoutState::from_raw(current);
            if state == CheckoutState::Free {
                return Err(());
            }
            if self
                .state
                .compare_exchange(
                    current,
                    CheckoutState::Free as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(state == CheckoutState::CheckedOutRemoveOnRelease);
            }
        }
    }

    /// Moves the parked object out for a checkout. Panics if the body is
    /// absent: the caller must hold the checkout mark, which guarantees
    /// presence.
    pub fn take_body(&self) -> ManagedObject {
        match self.body.lock().take() {
            Some(object) => object,
            None => panic!("managed object body missing for checked-out {}", self.id),
        }
    }

    /// Parks the object back after release.
    pub fn put_body(&self, object: ManagedObject) {
        let mut body = self.body.lock();
        assert!(
            body.is_none(),
            "double release: body already present for {}",
            self.id
        );
        *body = Some(object);
    }

    /// Read-only peek at the parked body, `None` while checked out.
    pub fn with_body<R>(&self, f: impl FnOnce(&ManagedObject) -> R) -> Option<R> {
        self.body.lock().as_ref().map(f)
    }
}

impl std::fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReference")
            .field("id", &self.id)
            .field("state", &self.checkout_state())
            .field("is_new", &self.is_new())
            .finish()
    }
}

/// The in-memory map from object id to reference entry — the concurrency
/// unit of the object manager.
#[derive(Default)]
pub struct ReferenceTable {
    entries: RwLock<HashMap<ObjectId, Arc<ObjectReference>>>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectId) -> Option<Arc<ObjectReference>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Inserts a fresh entry. A concurrently present entry is a fatal
    /// invariant violation (ids are unique while resident); however, a
    /// lost faulting race is legal: if another thread faulted the same id
    /// first, its entry wins and is returned.
    pub fn insert_new(&self, entry: Arc<ObjectReference>) -> Arc<ObjectReference> {
        let mut entries = self.entries.write();
        match entries.get(&entry.id()) {
            Some(existing) => existing.clone(),
            None => {
                entries.insert(entry.id(), entry.clone());
                entry
            }
        }
    }

    /// Inserts an entry for a created object; presence is fatal.
    pub fn insert_created(&self, entry: Arc<ObjectReference>) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&entry.id()) {
            panic!(
                "reference already present while creating object: {:?}",
                existing
            );
        }
        entries.insert(entry.id(), entry);
    }

    pub fn remove(&self, id: ObjectId) -> Option<Arc<ObjectReference>> {
        self.entries.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn resident_ids(&self) -> Vec<ObjectId> {
        self.entries.read().keys().copied().collect()
    }

    /// Snapshot of all entries, for the stop-flush path.
    pub fn entries(&self) -> Vec<Arc<ObjectReference>> {
        self.entries.read().values().cloned().collect()
    }
}
