use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata_core::ObjectId;
use strata_store::RecoveryLog;

use crate::manager::ObjectManager;
use crate::ObjectManagerError;

/// Summary of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub elapsed: Duration,
    pub total_objects: usize,
    pub garbage_count: usize,
}

impl GcStats {
    pub fn empty() -> Self {
        Self {
            elapsed: Duration::ZERO,
            total_objects: 0,
            garbage_count: 0,
        }
    }
}

/// Coordination contract between a collector and the object manager.
///
/// While `is_pausing_or_paused` is true the manager refuses new
/// read-write checkouts; read-only lookups stay permitted so the
/// collector's own mark phase cannot deadlock against the barrier. Once
/// the outstanding checkout count drains the manager calls
/// `notify_ready_to_gc`.
pub trait GarbageCollector: Send + Sync {
    fn start(&self) {}
    fn stop(&self) {}
    fn is_pausing_or_paused(&self) -> bool;
    fn is_paused(&self) -> bool;
    fn notify_ready_to_gc(&self);
    /// Reference-mutation notification; feeds the mark phase's rescue
    /// set so concurrent root/reference creation is not missed.
    fn changed(&self, changed: ObjectId, old_reference: ObjectId, new_reference: ObjectId);
    /// Runs one collection cycle.
    fn collect(&self, manager: &ObjectManager) -> GcStats;
}

/// Placeholder collector: never pauses, never collects.
pub struct NullGarbageCollector;

impl GarbageCollector for NullGarbageCollector {
    fn is_pausing_or_paused(&self) -> bool {
        false
    }
    fn is_paused(&self) -> bool {
        false
    }
    fn notify_ready_to_gc(&self) {}
    fn changed(&self, _changed: ObjectId, _old: ObjectId, _new: ObjectId) {}
    fn collect(&self, _manager: &ObjectManager) -> GcStats {
        GcStats::empty()
    }
}

const STATE_IDLE: u8 = 0;
const STATE_PAUSING: u8 = 1;
const STATE_PAUSED: u8 = 2;

/// Full mark-and-sweep collector.
///
/// A cycle pauses checkouts (read-write only), walks reachability from
/// the named roots through ordinary read-only checkouts, deletes the
/// unreachable remainder, and resumes pending lookups.
pub struct MarkSweepCollector {
    state: AtomicU8,
    stopped: AtomicBool,
    /// Object ids referenced by mutations since the cycle started; the
    /// mark phase drains this until it runs dry.
    rescue: Mutex<HashSet<ObjectId>>,
    last_stats: Mutex<Option<GcStats>>,
}

impl MarkSweepCollector {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            stopped: AtomicBool::new(false),
            rescue: Mutex::new(HashSet::new()),
            last_stats: Mutex::new(None),
        }
    }

    pub fn last_stats(&self) -> Option<GcStats> {
        *self.last_stats.lock()
    }

    fn mark(&self, manager: &ObjectManager) -> HashSet<ObjectId> {
        let mut marked: HashSet<ObjectId> = HashSet::new();
        let mut frontier: VecDeque<ObjectId> =
            manager.store().roots().values().copied().collect();

        loop {
            while let Some(id) = frontier.pop_front() {
                if id.is_null() || !marked.insert(id) {
                    continue;
                }
                // Read-only checkouts are permitted during the pause.
                let Some(object) = manager.try_get_object_read_only(id) else {
                    continue;
                };
                frontier.extend(object.state().reachable_ids());
                manager.release_read_only(object);
            }
            // Anything referenced while we were pausing gets rescued.
            let rescued: Vec<ObjectId> = self.rescue.lock().drain().collect();
            if rescued.is_empty() {
                break;
            }
            frontier.extend(rescued);
        }
        marked
    }
}

impl Default for MarkSweepCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl GarbageCollector for MarkSweepCollector {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_pausing_or_paused(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_IDLE
    }

    fn is_paused(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PAUSED
    }

    fn notify_ready_to_gc(&self) {
        let _ = self.state.compare_exchange(
            STATE_PAUSING,
            STATE_PAUSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn changed(&self, _changed: ObjectId, _old_reference: ObjectId, new_reference: ObjectId) {
        if new_reference.is_null() {
            return;
        }
        if self.is_pausing_or_paused() {
            self.rescue.lock().insert(new_reference);
        }
    }

    fn collect(&self, manager: &ObjectManager) -> GcStats {
        if self.stopped.load(Ordering::Acquire) {
            return GcStats::empty();
        }
        let start = Instant::now();
        self.rescue.lock().clear();
        self.state.store(STATE_PAUSING, Ordering::Release);

        manager.wait_until_ready_to_gc();

        let candidates = manager.store().snapshot_object_ids();
        let total_objects = candidates.len();
        let marked = self.mark(manager);
        let garbage: BTreeSet<ObjectId> = candidates
            .into_iter()
            .filter(|id| !marked.contains(id))
            .collect();
        let garbage_count = garbage.len();

        // Deletion runs inside the pause window: entries leave the table
        // before any new read-write checkout can fault them back in.
        if let Err(err) = manager.delete_objects(&garbage) {
            tracing::error!(
                target = "strata.gc",
                error = %err,
                "failed to delete garbage from store"
            );
        }

        self.state.store(STATE_IDLE, Ordering::Release);
        manager.resume_pending_after_gc();

        let stats = GcStats {
            elapsed: start.elapsed(),
            total_objects,
            garbage_count,
        };
        tracing::info!(
            target = "strata.gc",
            total = stats.total_objects,
            garbage = stats.garbage_count,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "mark-and-sweep cycle complete"
        );
        *self.last_stats.lock() = Some(stats);
        stats
    }
}

/// Incremental collector: deletes explicitly submitted objects in small
/// batches without a global pause, persisting the pending-delete set so
/// a crash mid-delete resumes instead of leaking or double-deleting.
pub struct InlineGarbageCollector {
    max_objects_per_pass: usize,
    recovery: Arc<RecoveryLog>,
    queued: Mutex<BTreeSet<ObjectId>>,
}

impl InlineGarbageCollector {
    pub fn new(max_objects_per_pass: usize, recovery: Arc<RecoveryLog>) -> Self {
        Self {
            max_objects_per_pass: max_objects_per_pass.max(1),
            recovery,
            queued: Mutex::new(BTreeSet::new()),
        }
    }

    /// Queues objects for deletion on the next pass.
    pub fn submit_deletions(&self, ids: impl IntoIterator<Item = ObjectId>) {
        self.queued.lock().extend(ids);
    }

    /// Replays the pending-delete set a previous process persisted but
    /// never completed. Missing objects are tolerated: a passive replica
    /// still syncing from the active may not have them yet.
    pub fn recover(&self, manager: &ObjectManager) -> Result<(), ObjectManagerError> {
        let pending = self.recovery.pending_deletes();
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(
            target = "strata.gc",
            count = pending.len(),
            "resuming pending deletions from a previous run"
        );
        let retry = manager.try_delete_objects(&pending)?;
        let completed: BTreeSet<ObjectId> = pending.difference(&retry).copied().collect();
        self.recovery.clear_pending_deletes(&completed)?;
        self.queued.lock().extend(retry);
        Ok(())
    }

    fn delete_batch(
        &self,
        manager: &ObjectManager,
        batch: &BTreeSet<ObjectId>,
    ) -> Result<BTreeSet<ObjectId>, ObjectManagerError> {
        // Persist first: a crash after this point resumes the delete
        // rather than losing it.
        self.recovery.record_pending_deletes(batch)?;
        let retry = manager.try_delete_objects(batch)?;
        let completed: BTreeSet<ObjectId> = batch.difference(&retry).copied().collect();
        self.recovery.clear_pending_deletes(&completed)?;
        Ok(retry)
    }
}

impl GarbageCollector for InlineGarbageCollector {
    fn is_pausing_or_paused(&self) -> bool {
        false
    }

    fn is_paused(&self) -> bool {
        false
    }

    fn notify_ready_to_gc(&self) {}

    fn changed(&self, _changed: ObjectId, old_reference: ObjectId, _new_reference: ObjectId) {
        // Dropped references are deletion candidates once nothing else
        // points at them; the submitter decides, not this hook.
        let _ = old_reference;
    }

    fn collect(&self, manager: &ObjectManager) -> GcStats {
        let start = Instant::now();
        let batch: BTreeSet<ObjectId> = {
            let mut queued = self.queued.lock();
            let take: Vec<ObjectId> = queued
                .iter()
                .take(self.max_objects_per_pass)
                .copied()
                .collect();
            for id in &take {
                queued.remove(id);
            }
            take.into_iter().collect()
        };
        if batch.is_empty() {
            return GcStats::empty();
        }
        let total = batch.len();
        match self.delete_batch(manager, &batch) {
            Ok(retry) => {
                let deleted = total - retry.len();
                if !retry.is_empty() {
                    // Still checked out somewhere; try again next pass.
                    self.queued.lock().extend(retry);
                }
                GcStats {
                    elapsed: start.elapsed(),
                    total_objects: total,
                    garbage_count: deleted,
                }
            }
            Err(err) => {
                tracing::error!(
                    target = "strata.gc",
                    error = %err,
                    "inline delete pass failed; objects stay queued"
                );
                self.queued.lock().extend(batch);
                GcStats::empty()
            }
        }
    }
}

struct DriverShared {
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// Background thread driving periodic collection cycles.
pub struct GcDriver {
    shared: Arc<DriverShared>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl GcDriver {
    pub fn spawn(manager: Arc<ObjectManager>, interval: Duration) -> Self {
        let shared = Arc::new(DriverShared {
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("strata-gc".to_string())
            .spawn(move || loop {
                {
                    let mut stop = thread_shared.stop.lock();
                    if *stop {
                        return;
                    }
                    thread_shared.wakeup.wait_for(&mut stop, interval);
                    if *stop {
                        return;
                    }
                }
                let collector = manager.garbage_collector();
                collector.collect(&manager);
            })
            .unwrap_or_else(|err| panic!("failed to spawn gc driver: {err}"));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
