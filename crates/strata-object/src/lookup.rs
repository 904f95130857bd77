use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strata_core::ObjectId;

use crate::object::ManagedObject;

/// Checkout access level. Read-only lookups are permitted while the
/// garbage collector is pausing; read-write lookups are parked so the
/// pause barrier can drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Read,
    ReadWrite,
}

/// Whether an absent object is an acceptable outcome for this lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingObjects {
    Ok,
    NotOk,
}

/// A checkout request over a set of object ids.
///
/// The id set is ordered: every multi-object request acquires marks in
/// the same global order, which is the deadlock-avoidance mechanism for
/// concurrent overlapping requests.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub ids: BTreeSet<ObjectId>,
    /// Ids this request just created and is therefore allowed to see
    /// while still new. Everyone else treats new objects as invisible.
    pub new_object_ids: HashSet<ObjectId>,
    pub access: AccessLevel,
}

impl LookupRequest {
    pub fn read(ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            new_object_ids: HashSet::new(),
            access: AccessLevel::Read,
        }
    }

    pub fn read_write(ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            new_object_ids: HashSet::new(),
            access: AccessLevel::ReadWrite,
        }
    }

    pub fn with_new_object_ids(mut self, ids: impl IntoIterator<Item = ObjectId>) -> Self {
        self.new_object_ids = ids.into_iter().collect();
        self
    }
}

/// Checked-out objects plus the ids that turned out not to exist.
/// Absence is a recorded, normal outcome — not an error.
#[derive(Debug, Default)]
pub struct LookupResults {
    pub objects: Vec<ManagedObject>,
    pub missing_object_ids: BTreeSet<ObjectId>,
}

impl LookupResults {
    pub fn take_object(&mut self, id: ObjectId) -> Option<ManagedObject> {
        let idx = self.objects.iter().position(|o| o.id() == id)?;
        Some(self.objects.swap_remove(idx))
    }
}

/// Push-style delivery of lookup results. The object manager calls this
/// from whichever thread completes the lookup — the requester's own
/// thread when the objects were immediately available, or a releasing
/// thread when a parked request gets retried.
pub trait LookupResponder: Send + Sync {
    fn set_results(&self, results: LookupResults);
}

/// Responder that parks the calling thread until results arrive; backs
/// the synchronous `get_object_by_id` convenience API.
#[derive(Default)]
pub struct WaitForLookup {
    slot: Mutex<Option<LookupResults>>,
    delivered: Condvar,
}

impl WaitForLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self) -> LookupResults {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.delivered.wait(&mut slot);
        }
        slot.take().unwrap_or_else(|| unreachable!())
    }

    pub fn wait_for(&self, timeout: Duration) -> Option<LookupResults> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            let _ = self.delivered.wait_for(&mut slot, timeout);
        }
        slot.take()
    }
}

impl LookupResponder for WaitForLookup {
    fn set_results(&self, results: LookupResults) {
        let mut slot = self.slot.lock();
        assert!(slot.is_none(), "lookup results delivered twice");
        *slot = Some(results);
        self.delivered.notify_all();
    }
}
