use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use strata_core::{NodeId, ObjectId};
use strata_store::ObjectStore;

use crate::gc::{GarbageCollector, NullGarbageCollector};
use crate::lookup::{
    AccessLevel, LookupRequest, LookupResponder, LookupResults, MissingObjects, WaitForLookup,
};
use crate::object::{ManagedObject, ServerContext};
use crate::pending::{ParkedLookup, PendingQueue};
use crate::reference::{ObjectReference, ReferenceTable};
use crate::ObjectManagerError;

#[derive(Debug, Clone)]
pub struct ObjectManagerConfig {
    /// Persist dirty objects on every release (persistent-store mode).
    /// When off, read-only-release dirtiness checks are also skipped.
    pub paranoid: bool,
    /// Global cap on objects returned by one lookup, including
    /// reachability expansion.
    pub max_lookup_objects: usize,
    /// Store deletions are chunked into transactions of this many ids.
    pub delete_batch_size: usize,
    /// How long the GC-readiness wait sleeps between checks before
    /// logging that checkouts have not drained.
    pub gc_wait_warn_interval: Duration,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            paranoid: true,
            max_lookup_objects: 5000,
            delete_batch_size: 1000,
            gc_wait_warn_interval: Duration::from_secs(10),
        }
    }
}

/// Counters kept cheap enough to bump on every lookup.
#[derive(Default)]
struct Stats {
    cache_hits: AtomicU64,
    faults: AtomicU64,
    missing: AtomicU64,
    objects_created: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectManagerStats {
    pub cache_hits: u64,
    pub faults: u64,
    pub missing: u64,
    pub objects_created: u64,
}

/// Mutable core guarded by one mutex: the checkout count and the pending
/// queue change together, which is what makes the park/unblock handoff
/// race-free (a release cannot slip between a failed mark and the park).
struct Core {
    checked_out: usize,
    pending: PendingQueue,
}

/// Manages access to all managed objects in the system.
///
/// Checkout moves an object out of the reference table to the caller;
/// release moves it back and wakes requests blocked on that id. At most
/// one checkout holds an object at any instant.
pub struct ObjectManager {
    context: Arc<ServerContext>,
    store: Arc<dyn ObjectStore>,
    config: ObjectManagerConfig,
    table: ReferenceTable,
    core: Mutex<Core>,
    /// Signalled on every release; backs the GC drain wait and the
    /// delete-retry wait.
    released: Condvar,
    /// Read side is held by ordinary operations; the write side is taken
    /// only by `stop`.
    shutdown: RwLock<bool>,
    collector: RwLock<Arc<dyn GarbageCollector>>,
    stats: Stats,
}

impl ObjectManager {
    pub fn new(
        context: Arc<ServerContext>,
        store: Arc<dyn ObjectStore>,
        config: ObjectManagerConfig,
    ) -> Self {
        Self {
            context,
            store,
            config,
            table: ReferenceTable::new(),
            core: Mutex::new(Core {
                checked_out: 0,
                pending: PendingQueue::default(),
            }),
            released: Condvar::new(),
            shutdown: RwLock::new(false),
            collector: RwLock::new(Arc::new(NullGarbageCollector)),
            stats: Stats::default(),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &ObjectManagerConfig {
        &self.config
    }

    // ---- lookup ---------------------------------------------------------

    /// Asynchronous checkout of a set of objects. Returns `true` if the
    /// results were delivered synchronously through `responder`, `false`
    /// if the request is now pending (delivered later, from a releasing
    /// thread).
    pub fn lookup_objects_for(
        &self,
        node: NodeId,
        request: LookupRequest,
        responder: Arc<dyn LookupResponder>,
    ) -> bool {
        self.lookup_objects_and_subobjects_for(node, request, responder, 0)
    }

    /// Like [`ObjectManager::lookup_objects_for`], additionally expanding
    /// the checkout over already-resident reachable objects, bounded by
    /// `max_reachable`.
    pub fn lookup_objects_and_subobjects_for(
        &self,
        node: NodeId,
        request: LookupRequest,
        responder: Arc<dyn LookupResponder>,
        max_reachable: usize,
    ) -> bool {
        self.assert_open();
        let parked = ParkedLookup {
            node,
            request,
            responder,
            max_reachable,
            retries: 0,
        };
        self.basic_lookup(parked)
    }

    /// Blocks the calling thread until the object is available. Fails
    /// with a fatal assertion if the object does not exist — callers use
    /// this only for ids they know are live.
    pub fn get_object_by_id(&self, id: ObjectId) -> ManagedObject {
        self.wait_for_object(id, LookupRequest::read_write([id]), MissingObjects::NotOk)
            .unwrap_or_else(|| unreachable!())
    }

    /// Read-only variant of [`ObjectManager::get_object_by_id`]; permitted
    /// while the collector is pausing, which is what keeps the GC's own
    /// mark-phase lookups deadlock-free.
    pub fn get_object_by_id_read_only(&self, id: ObjectId) -> ManagedObject {
        self.wait_for_object(id, LookupRequest::read([id]), MissingObjects::NotOk)
            .unwrap_or_else(|| unreachable!())
    }

    /// Read-only checkout tolerating absence.
    pub fn try_get_object_read_only(&self, id: ObjectId) -> Option<ManagedObject> {
        self.wait_for_object(id, LookupRequest::read([id]), MissingObjects::Ok)
    }

    /// Read-write checkout tolerating absence — for callers racing
    /// against deletion, like the eviction worker applying a removal to a
    /// map that may have been dropped meanwhile.
    pub fn try_get_object(&self, id: ObjectId) -> Option<ManagedObject> {
        self.wait_for_object(id, LookupRequest::read_write([id]), MissingObjects::Ok)
    }

    /// Looks the object up even if it is still new, but returns `None`
    /// (after releasing) when it is — callers that need fully-applied
    /// state use this instead of faulting a half-constructed object.
    pub fn get_object_by_id_if_applied(&self, id: ObjectId) -> Option<ManagedObject> {
        let request = LookupRequest::read([id]).with_new_object_ids([id]);
        let object = self.wait_for_object(id, request, MissingObjects::Ok)?;
        if object.is_new() {
            tracing::warn!(
                target = "strata.object",
                %id,
                "skipping lookup of still-new object"
            );
            self.release_read_only(object);
            return None;
        }
        Some(object)
    }

    fn assert_open(&self) {
        assert!(
            !*self.shutdown.read(),
            "object manager used after shutdown"
        );
    }

    fn wait_for_object(
        &self,
        id: ObjectId,
        request: LookupRequest,
        missing: MissingObjects,
    ) -> Option<ManagedObject> {
        self.assert_open();
        let responder = Arc::new(WaitForLookup::new());
        let parked = ParkedLookup {
            node: NodeId::LOCAL,
            request,
            responder: responder.clone(),
            max_reachable: 0,
            retries: 0,
        };
        self.basic_lookup(parked);
        let mut results = responder.wait();
        match results.take_object(id) {
            Some(object) => Some(object),
            None => {
                assert!(
                    missing == MissingObjects::Ok,
                    "lookup of non-existent object {id}"
                );
                None
            }
        }
    }

    /// One checkout attempt. Either delivers results, or parks the
    /// request (pending on the GC barrier, or blocked on the specific
    /// object that could not be marked) and returns false.
    ///
    /// No shutdown assertion here: retried lookups driven from a release
    /// racing with `stop` complete rather than killing the releasing
    /// thread. The public entry points assert.
    fn basic_lookup(&self, mut parked: ParkedLookup) -> bool {
        let _shutdown = self.shutdown.read();

        // Fault absent references outside the core lock; the store read
        // is the expensive part and must not serialize other lookups.
        let mut missing: BTreeSet<ObjectId> = BTreeSet::new();
        for &id in &parked.request.ids {
            if self.table.get(id).is_none() {
                if !self.fault_from_store(id) {
                    missing.insert(id);
                }
            } else if parked.retries == 0 {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut core = self.core.lock();

        if parked.request.access == AccessLevel::ReadWrite
            && self.garbage_collector().is_pausing_or_paused()
        {
            // Read-write checkouts would starve the pause barrier; park
            // until the collector finishes.
            core.pending.park_ready(parked);
            return false;
        }

        let mut marked: Vec<Arc<ObjectReference>> = Vec::with_capacity(parked.request.ids.len());
        let mut blocked_on: Option<ObjectId> = None;

        // Ids arrive sorted (BTreeSet); every concurrent multi-object
        // request therefore attempts marks in the same global order.
        for &id in &parked.request.ids {
            if missing.contains(&id) {
                continue;
            }
            let Some(entry) = self.table.get(id) else {
                // Deleted between the fault phase and now.
                missing.insert(id);
                continue;
            };
            let visible = !entry.is_new() || parked.request.new_object_ids.contains(&id);
            if !visible || !entry.mark_referenced(false) {
                if !entry.is_referenced() && entry.is_new() {
                    tracing::warn!(
                        target = "strata.object",
                        %id,
                        "parking lookup: object is new and not in the request's new-object set"
                    );
                }
                blocked_on = Some(id);
                break;
            }
            marked.push(entry);
            core.checked_out += 1;
        }

        if let Some(blocked_id) = blocked_on {
            // Roll the whole batch back; partial checkouts would deadlock
            // against the competing holder.
            for entry in marked {
                if entry.unmark_referenced().is_err() {
                    panic!("rollback of unmarked reference {}", entry.id());
                }
                core.checked_out -= 1;
            }
            parked.retries += 1;
            if parked.retries % 10 == 0 {
                tracing::warn!(
                    target = "strata.object",
                    node = %parked.node,
                    %blocked_id,
                    retries = parked.retries,
                    pending = core.pending.total_len(),
                    "lookup still contended"
                );
            }
            let depth = core.pending.total_len() + 1;
            if depth % 500 == 0 {
                tracing::warn!(
                    target = "strata.object",
                    depth,
                    "pending lookup queue is deep"
                );
            }
            core.pending.park_blocked(blocked_id, parked);
            return false;
        }

        if parked.max_reachable > 0 {
            self.expand_reachable(&mut core, &mut marked, parked.max_reachable);
        }

        drop(core);

        self.stats
            .missing
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        let objects: Vec<ManagedObject> = marked.iter().map(|entry| entry.take_body()).collect();
        parked.responder.set_results(LookupResults {
            objects,
            missing_object_ids: missing,
        });
        true
    }

    /// Traverses already-resident, unreferenced, non-new objects reachable
    /// from the batch, marking each one too. Purely opportunistic: a
    /// failed mark skips the object rather than blocking.
    fn expand_reachable(
        &self,
        core: &mut Core,
        marked: &mut Vec<Arc<ObjectReference>>,
        max_reachable: usize,
    ) {
        let limit = marked
            .len()
            .saturating_add(max_reachable.max(1))
            .min(self.config.max_lookup_objects);
        let mut seen: std::collections::HashSet<ObjectId> =
            marked.iter().map(|e| e.id()).collect();
        let mut frontier: Vec<ObjectId> = marked
            .iter()
            .flat_map(|entry| {
                entry
                    .with_body(|object| object.state().reachable_ids())
                    .unwrap_or_default()
            })
            .collect();

        while !frontier.is_empty() && marked.len() < limit {
            let mut next = Vec::new();
            for id in frontier {
                if marked.len() >= limit {
                    break;
                }
                if !seen.insert(id) {
                    continue;
                }
                let Some(entry) = self.table.get(id) else {
                    continue;
                };
                if entry.is_new() || !entry.mark_referenced(false) {
                    continue;
                }
                if let Some(reachable) = entry.with_body(|object| object.state().reachable_ids()) {
                    next.extend(reachable);
                }
                marked.push(entry);
                core.checked_out += 1;
            }
            frontier = next;
        }
    }

    /// Faults a reference in from the store. Returns false when the store
    /// has no such object.
    fn fault_from_store(&self, id: ObjectId) -> bool {
        let stored = match self.store.load_object(id) {
            Ok(Some(stored)) => stored,
            Ok(None) => return false,
            Err(err) => {
                tracing::error!(
                    target = "strata.object",
                    %id,
                    error = %err,
                    "store load failed during fault"
                );
                return false;
            }
        };
        let object = match ManagedObject::from_stored(self.context.state_factory.as_ref(), stored) {
            Ok(object) => object,
            Err(err) => {
                tracing::error!(
                    target = "strata.object",
                    %id,
                    error = %err,
                    "failed to revive stored object"
                );
                return false;
            }
        };
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        self.table
            .insert_new(Arc::new(ObjectReference::new(id, object)));
        true
    }

    // ---- release --------------------------------------------------------

    /// Returns a read-write checkout. New objects are committed to the
    /// store on their first release; dirty objects are flushed when
    /// running paranoid.
    pub fn release(&self, mut object: ManagedObject) {
        let id = object.id();
        let was_new = object.is_new();
        if was_new || (self.config.paranoid && object.is_dirty()) {
            let mut tx = self.store.begin();
            object.clear_new();
            object.clear_dirty();
            tx.save_object(object.to_stored());
            if let Err(err) = tx.commit() {
                // The object stays resident and dirty-tracked in memory;
                // the operator sees the store failure.
                tracing::error!(
                    target = "strata.object",
                    %id,
                    error = %err,
                    "failed to flush released object"
                );
            }
        } else {
            object.clear_dirty();
        }
        self.basic_release(object, was_new);
    }

    /// Returns a read-only checkout. Dirtying an object under a read-only
    /// checkout is a fatal invariant violation (paranoid mode).
    pub fn release_read_only(&self, object: ManagedObject) {
        if self.config.paranoid && !object.is_new() && object.is_dirty() {
            panic!(
                "object {} is dirty after a read-only checkout",
                object.id()
            );
        }
        self.basic_release(object, false);
    }

    pub fn release_all(&self, objects: impl IntoIterator<Item = ManagedObject>) {
        for object in objects {
            self.release(object);
        }
    }

    pub fn release_all_read_only(&self, objects: impl IntoIterator<Item = ManagedObject>) {
        for object in objects {
            self.release_read_only(object);
        }
    }

    fn basic_release(&self, object: ManagedObject, clear_new: bool) {
        let id = object.id();
        let drained = {
            let mut core = self.core.lock();
            let entry = self
                .table
                .get(id)
                .unwrap_or_else(|| panic!("release of unknown object {id}"));
            if clear_new {
                entry.clear_new();
            }
            let remove_on_release = match entry.unmark_referenced() {
                Ok(flag) => flag,
                Err(()) => panic!("release of an object that is not checked out: {id}"),
            };
            core.checked_out -= 1;
            if remove_on_release {
                assert!(
                    !object.is_dirty(),
                    "remove-on-release object {id} is dirty"
                );
                self.table.remove(id);
            } else {
                entry.put_body(object);
            }
            core.pending.unblock(id);
            self.post_release(&mut core)
        };
        self.finish_release(drained);
    }

    /// Runs with the core lock held; returns the requests to retry once
    /// the lock is dropped.
    fn post_release(&self, core: &mut Core) -> Vec<ParkedLookup> {
        self.released.notify_all();
        if self.garbage_collector().is_pausing_or_paused() {
            if core.checked_out == 0 {
                tracing::info!(
                    target = "strata.gc",
                    pending = core.pending.total_len(),
                    "checkout count drained; notifying collector"
                );
                self.garbage_collector().notify_ready_to_gc();
            }
            // Pending lookups stay parked until the collector finishes.
            Vec::new()
        } else {
            core.pending.drain_ready()
        }
    }

    fn finish_release(&self, drained: Vec<ParkedLookup>) {
        for parked in drained {
            self.basic_lookup(parked);
        }
    }

    // ---- creation -------------------------------------------------------

    /// Creates fresh managed objects. They are invisible to lookups that
    /// do not declare their ids as new until their first release.
    pub fn create_new_objects(&self, ids: &BTreeSet<ObjectId>) {
        self.assert_open();
        for &id in ids {
            assert!(!id.is_null(), "attempt to create the null object");
            let state = self.context.state_factory.new_state(id);
            let object = ManagedObject::new_object(id, state);
            self.table
                .insert_created(Arc::new(ObjectReference::new(id, object)));
            self.stats.objects_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Binds a root name to an object id, durably. The collector hears
    /// about the new root so an in-flight mark phase does not miss it.
    pub fn create_root(&self, name: &str, id: ObjectId) -> Result<(), ObjectManagerError> {
        self.assert_open();
        let mut tx = self.store.begin();
        tx.save_root(name, id);
        tx.commit()?;
        self.garbage_collector()
            .changed(ObjectId::NULL, ObjectId::NULL, id);
        Ok(())
    }

    pub fn lookup_root_id(&self, name: &str) -> Option<ObjectId> {
        self.store.root_id(name)
    }

    pub fn root_names(&self) -> Vec<String> {
        self.store.roots().keys().cloned().collect()
    }

    // ---- deletion -------------------------------------------------------

    /// Deletes every object in `ids` that is not currently checked out.
    /// Checked-out objects are returned for the caller to reschedule.
    pub fn try_delete_objects(
        &self,
        ids: &BTreeSet<ObjectId>,
    ) -> Result<BTreeSet<ObjectId>, ObjectManagerError> {
        let mut retry = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        let drained = {
            let mut core = self.core.lock();
            for &id in ids {
                match self.table.get(id) {
                    None => {
                        deleted.insert(id);
                    }
                    Some(entry) => {
                        assert!(!entry.is_new(), "deleting a new object {id}");
                        // Claim the entry with remove-on-release so no
                        // lookup can slip in while we unlink it.
                        if entry.mark_referenced(true) {
                            self.table.remove(id);
                            deleted.insert(id);
                        } else {
                            retry.insert(id);
                        }
                    }
                }
            }
            for &id in &deleted {
                core.pending.unblock(id);
            }
            self.post_release(&mut core)
        };
        self.remove_from_store(&deleted)?;
        self.finish_release(drained);
        Ok(retry)
    }

    /// Deletes objects after a GC pause, when nothing can hold a
    /// checkout. A referenced entry here is a fatal invariant violation.
    pub fn delete_objects(&self, ids: &BTreeSet<ObjectId>) -> Result<(), ObjectManagerError> {
        {
            let _core = self.core.lock();
            for &id in ids {
                if let Some(entry) = self.table.get(id) {
                    assert!(
                        !entry.is_referenced(),
                        "deleting checked-out object {id} after GC pause"
                    );
                    self.table.remove(id);
                }
            }
        }
        self.remove_from_store(ids)
    }

    fn remove_from_store(&self, ids: &BTreeSet<ObjectId>) -> Result<(), ObjectManagerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let all: Vec<ObjectId> = ids.iter().copied().collect();
        for chunk in all.chunks(self.config.delete_batch_size.max(1)) {
            let mut tx = self.store.begin();
            tx.delete_objects(&chunk.iter().copied().collect());
            tx.commit()?;
        }
        let elapsed = start.elapsed();
        if elapsed > Duration::from_millis(300) {
            tracing::info!(
                target = "strata.object",
                count = ids.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "removed objects from store"
            );
        }
        Ok(())
    }

    /// Re-runs every pending lookup once the collector finishes; pending
    /// processing is disabled for the duration of the pause.
    pub fn resume_pending_after_gc(&self) {
        let drained = {
            let mut core = self.core.lock();
            self.released.notify_all();
            core.pending.drain_ready()
        };
        self.finish_release(drained);
    }

    // ---- garbage collector coordination ---------------------------------

    pub fn garbage_collector(&self) -> Arc<dyn GarbageCollector> {
        self.collector.read().clone()
    }

    /// Swaps the collector implementation, stopping the old one first.
    pub fn set_garbage_collector(&self, collector: Arc<dyn GarbageCollector>) {
        self.assert_open();
        let old = {
            let mut slot = self.collector.write();
            std::mem::replace(&mut *slot, collector)
        };
        old.stop();
    }

    /// Blocks the collector thread until the outstanding checkout count
    /// reaches zero, re-checking on every release and logging when the
    /// drain takes suspiciously long.
    pub fn wait_until_ready_to_gc(&self) {
        let mut core = self.core.lock();
        if core.checked_out == 0 {
            self.garbage_collector().notify_ready_to_gc();
        }
        let mut warns = 0u32;
        while !self.garbage_collector().is_paused() {
            let timed_out = self
                .released
                .wait_for(&mut core, self.config.gc_wait_warn_interval)
                .timed_out();
            if core.checked_out == 0 && !self.garbage_collector().is_paused() {
                self.garbage_collector().notify_ready_to_gc();
            }
            if timed_out {
                warns += 1;
                if warns > 2 {
                    tracing::warn!(
                        target = "strata.gc",
                        checked_out = core.checked_out,
                        "still waiting for objects to be checked back in"
                    );
                }
            }
        }
    }

    pub fn checked_out_count(&self) -> usize {
        self.core.lock().checked_out
    }

    pub fn is_referenced(&self, id: ObjectId) -> bool {
        self.table
            .get(id)
            .map(|entry| entry.is_referenced())
            .unwrap_or(false)
    }

    pub fn resident_count(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> ObjectManagerStats {
        ObjectManagerStats {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            faults: self.stats.faults.load(Ordering::Relaxed),
            missing: self.stats.missing.load(Ordering::Relaxed),
            objects_created: self.stats.objects_created.load(Ordering::Relaxed),
        }
    }

    // ---- shutdown -------------------------------------------------------

    /// Stops the manager: excludes new operations, stops the collector,
    /// and flushes every resident non-new object to the store.
    pub fn stop(&self) -> Result<(), ObjectManagerError> {
        {
            let mut shutdown = self.shutdown.write();
            if *shutdown {
                return Ok(());
            }
            *shutdown = true;
        }
        self.garbage_collector().stop();

        let mut to_flush = Vec::new();
        for entry in self.table.entries() {
            if let Some(stored) = entry.with_body(|object| {
                if object.is_new() {
                    None
                } else {
                    Some(object.to_stored())
                }
            }) {
                to_flush.extend(stored);
            }
        }
        if !to_flush.is_empty() {
            let count = to_flush.len();
            let mut tx = self.store.begin();
            tx.save_all_objects(to_flush);
            tx.commit()?;
            tracing::info!(
                target = "strata.object",
                count,
                "flushed resident objects at shutdown"
            );
        }
        Ok(())
    }
}
