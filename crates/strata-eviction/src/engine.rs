use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use strata_core::{unix_seconds, ObjectId};
use strata_object::ObjectManager;
use strata_store::{EvictionRecord, RecoveryLog, StoreError};
use thiserror::Error;

use crate::client::ClientObjectReferenceSet;
use crate::periodic::PeriodicEvictionTrigger;
use crate::trigger::{EntryExpiryProbe, EvictionTrigger};

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A transactional removal produced from one eviction pass, carrying a
/// globally-ordered transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMapEvictionTransaction {
    pub transaction_id: u64,
    pub object_id: ObjectId,
    pub cache_name: String,
    pub keys: Vec<String>,
}

/// Downstream consumer of eviction-removal transactions (replication,
/// client broadcast). Hand-off only; the engine applies the removal
/// itself.
pub trait TransactionBatchSink: Send + Sync {
    fn submit(&self, transaction: &ServerMapEvictionTransaction);
}

#[derive(Debug, Clone)]
pub struct EvictionEngineConfig {
    /// Interval between periodic TTI/TTL sweeps.
    pub evictor_sleep: Duration,
    /// Capacity of the bounded removal work queue.
    pub queue_capacity: usize,
}

impl Default for EvictionEngineConfig {
    fn default() -> Self {
        Self {
            evictor_sleep: Duration::from_secs(15 * 60),
            queue_capacity: 64,
        }
    }
}

#[derive(Default)]
struct Stats {
    passes: AtomicU64,
    maps_examined: AtomicU64,
    samples_taken: AtomicU64,
    entries_evicted: AtomicU64,
    skipped_in_progress: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub passes: u64,
    pub maps_examined: u64,
    pub samples_taken: u64,
    pub entries_evicted: u64,
    pub skipped_in_progress: u64,
}

enum Work {
    Evict(ServerMapEvictionTransaction),
    Shutdown,
}

/// Computes entry expiry by faulting the value object through the
/// object manager's read-only checkout path.
struct ObjectExpiryProbe<'a> {
    manager: &'a ObjectManager,
    now: i64,
}

impl EntryExpiryProbe for ObjectExpiryProbe<'_> {
    fn expires_in(&self, value: ObjectId, tti_seconds: i64, ttl_seconds: i64) -> i64 {
        let Some(object) = self.manager.get_object_by_id_if_applied(value) else {
            return 0;
        };
        let expires = object
            .state()
            .as_evictable_entry()
            .map(|entry| entry.expires_in(self.now, tti_seconds, ttl_seconds))
            .unwrap_or(0);
        self.manager.release_read_only(object);
        expires
    }
}

/// Drives eviction triggers against live server maps and converts their
/// samples into transactional removals.
///
/// Per map: read-only checkout → trigger sampling → persist the
/// in-flight record → release the checkout → enqueue the removal. The
/// release happens strictly before the enqueue: the work queue is
/// bounded, and blocking on a full queue while holding a checkout is a
/// deadlock.
pub struct EvictionEngine {
    manager: Arc<ObjectManager>,
    clients: Arc<dyn ClientObjectReferenceSet>,
    batch_sink: Arc<dyn TransactionBatchSink>,
    recovery: Arc<RecoveryLog>,
    config: EvictionEngineConfig,
    currently_evicting: Mutex<HashSet<ObjectId>>,
    next_transaction_id: AtomicU64,
    started: AtomicBool,
    stats: Stats,
    work_tx: Sender<Work>,
    work_rx: Mutex<Option<Receiver<Work>>>,
    stop: Mutex<bool>,
    wakeup: Condvar,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl EvictionEngine {
    pub fn new(
        manager: Arc<ObjectManager>,
        clients: Arc<dyn ClientObjectReferenceSet>,
        batch_sink: Arc<dyn TransactionBatchSink>,
        recovery: Arc<RecoveryLog>,
        config: EvictionEngineConfig,
    ) -> Self {
        let (work_tx, work_rx) = bounded(config.queue_capacity.max(1));
        Self {
            manager,
            clients,
            batch_sink,
            recovery,
            config,
            currently_evicting: Mutex::new(HashSet::new()),
            next_transaction_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            stats: Stats::default(),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the removal worker and the periodic evictor. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            target = "strata.eviction",
            sleep_ms = self.config.evictor_sleep.as_millis() as u64,
            "eviction engine starting"
        );
        let receiver = self
            .work_rx
            .lock()
            .take()
            .unwrap_or_else(|| unreachable!("worker receiver already taken"));
        let mut threads = self.threads.lock();

        let worker = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("strata-evictor-worker".to_string())
                .spawn(move || worker.run_worker(receiver))
                .unwrap_or_else(|err| panic!("failed to spawn eviction worker: {err}")),
        );

        let periodic = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("strata-evictor".to_string())
                .spawn(move || periodic.run_periodic())
                .unwrap_or_else(|err| panic!("failed to spawn periodic evictor: {err}")),
        );
    }

    pub fn stop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        *self.stop.lock() = true;
        self.wakeup.notify_all();
        let _ = self.work_tx.send(Work::Shutdown);
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Resubmits every eviction transaction a previous process persisted
    /// but never completed. Call once after `start`.
    pub fn recover(&self) {
        let in_flight = self.recovery.in_flight_evictions();
        if in_flight.is_empty() {
            return;
        }
        tracing::info!(
            target = "strata.eviction",
            count = in_flight.len(),
            "resubmitting in-flight eviction transactions from a previous run"
        );
        for record in in_flight {
            self.currently_evicting.lock().insert(record.object_id);
            let txn = ServerMapEvictionTransaction {
                transaction_id: self.next_transaction_id.fetch_add(1, Ordering::Relaxed),
                object_id: record.object_id,
                cache_name: record.cache_name,
                keys: record.candidate_keys,
            };
            let _ = self.work_tx.send(Work::Evict(txn));
        }
    }

    /// Runs one eviction attempt against one map. Returns true when a
    /// removal transaction was produced and submitted.
    pub fn evict_on(
        &self,
        map_id: ObjectId,
        trigger: &mut dyn EvictionTrigger,
    ) -> Result<bool, EvictionError> {
        assert!(
            self.started.load(Ordering::Acquire),
            "evictor is not started yet"
        );
        if !self.mark_eviction_in_progress(map_id) {
            tracing::info!(
                target = "strata.eviction",
                %map_id,
                "ignoring eviction request; a pass is already in progress"
            );
            self.stats.skipped_in_progress.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let produced = self.basic_evict(map_id, trigger);
        if !matches!(produced, Ok(true)) {
            self.mark_eviction_done(map_id);
        }
        produced
    }

    fn basic_evict(
        &self,
        map_id: ObjectId,
        trigger: &mut dyn EvictionTrigger,
    ) -> Result<bool, EvictionError> {
        let Some(object) = self.manager.get_object_by_id_if_applied(map_id) else {
            // Deleted (or still syncing) between selection and checkout.
            return Ok(false);
        };
        self.stats.maps_examined.fetch_add(1, Ordering::Relaxed);

        let Some(map) = object.state().as_evictable() else {
            panic!(
                "non-evictable object {map_id} reached the eviction path: {}",
                object.state().type_name()
            );
        };

        if !trigger.start_eviction(map) {
            self.manager.release_read_only(object);
            return Ok(false);
        }

        let now = unix_seconds();
        let probe = ObjectExpiryProbe {
            manager: self.manager.as_ref(),
            now,
        };
        let samples = trigger.collect_candidates(map, self.clients.as_ref(), &probe, now);
        self.stats
            .samples_taken
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        trigger.complete_eviction(map);

        if samples.is_empty() {
            self.manager.release_read_only(object);
            return Ok(false);
        }

        let cache_name = map.cache_name().to_string();
        let keys: Vec<String> = samples.into_iter().map(|s| s.key).collect();

        // Durability point: the in-flight record is persisted while we
        // still hold the map, before anything is submitted downstream.
        if let Err(err) = self.recovery.record_eviction(EvictionRecord {
            object_id: map_id,
            cache_name: cache_name.clone(),
            candidate_keys: keys.clone(),
        }) {
            map.eviction_completed();
            self.manager.release_read_only(object);
            return Err(err.into());
        }

        let transaction = ServerMapEvictionTransaction {
            transaction_id: self.next_transaction_id.fetch_add(1, Ordering::Relaxed),
            object_id: map_id,
            cache_name,
            keys,
        };

        self.manager.release_read_only(object);
        // Only now is it safe to block on a full queue.
        let _ = self.work_tx.send(Work::Evict(transaction));
        Ok(true)
    }

    fn run_worker(&self, receiver: Receiver<Work>) {
        while let Ok(work) = receiver.recv() {
            match work {
                Work::Evict(transaction) => self.process_removal(transaction),
                Work::Shutdown => return,
            }
        }
    }

    fn process_removal(&self, transaction: ServerMapEvictionTransaction) {
        // Downstream hand-off first: replication/broadcast sees the
        // transaction in submission order.
        self.batch_sink.submit(&transaction);

        match self.manager.try_get_object(transaction.object_id) {
            Some(mut object) => {
                {
                    let Some(map) = object.state_mut().as_evictable_mut() else {
                        panic!(
                            "non-evictable object {} reached the removal path",
                            transaction.object_id
                        );
                    };
                    map.remove_entries(&transaction.keys);
                }
                object
                    .state()
                    .as_evictable()
                    .unwrap_or_else(|| unreachable!())
                    .eviction_completed();
                self.manager.release(object);
                self.stats
                    .entries_evicted
                    .fetch_add(transaction.keys.len() as u64, Ordering::Relaxed);
            }
            None => {
                tracing::info!(
                    target = "strata.eviction",
                    map_id = %transaction.object_id,
                    "map deleted before its eviction transaction applied"
                );
            }
        }

        if let Err(err) = self.recovery.complete_eviction(transaction.object_id) {
            tracing::error!(
                target = "strata.eviction",
                map_id = %transaction.object_id,
                error = %err,
                "failed to clear in-flight eviction record"
            );
        }
        self.mark_eviction_done(transaction.object_id);
        tracing::debug!(
            target = "strata.eviction",
            map_id = %transaction.object_id,
            transaction_id = transaction.transaction_id,
            keys = transaction.keys.len(),
            cache = %transaction.cache_name,
            "eviction transaction applied"
        );
    }

    /// One full periodic sweep over every evictable map.
    pub fn run_evictor(&self) {
        self.stats.passes.fetch_add(1, Ordering::Relaxed);
        let evictable = self.manager.store().snapshot_evictable_object_ids();
        tracing::debug!(
            target = "strata.eviction",
            maps = evictable.len(),
            "periodic evictor pass starting"
        );
        for map_id in evictable {
            let mut trigger = PeriodicEvictionTrigger::new();
            if let Err(err) = self.evict_on(map_id, &mut trigger) {
                tracing::error!(
                    target = "strata.eviction",
                    %map_id,
                    error = %err,
                    "eviction pass failed; map skipped until the next sweep"
                );
            }
        }
        let stats = self.stats();
        tracing::info!(
            target = "strata.eviction",
            passes = stats.passes,
            maps_examined = stats.maps_examined,
            samples = stats.samples_taken,
            evicted = stats.entries_evicted,
            "periodic evictor pass finished"
        );
    }

    fn run_periodic(&self) {
        loop {
            {
                let mut stop = self.stop.lock();
                if *stop {
                    return;
                }
                self.wakeup.wait_for(&mut stop, self.config.evictor_sleep);
                if *stop {
                    return;
                }
            }
            self.run_evictor();
        }
    }

    fn mark_eviction_in_progress(&self, map_id: ObjectId) -> bool {
        self.currently_evicting.lock().insert(map_id)
    }

    fn mark_eviction_done(&self, map_id: ObjectId) {
        self.currently_evicting.lock().remove(&map_id);
    }

    pub fn is_evicting(&self, map_id: ObjectId) -> bool {
        self.currently_evicting.lock().contains(&map_id)
    }

    pub fn manager(&self) -> &Arc<ObjectManager> {
        &self.manager
    }

    pub fn stats(&self) -> EvictionStats {
        EvictionStats {
            passes: self.stats.passes.load(Ordering::Relaxed),
            maps_examined: self.stats.maps_examined.load(Ordering::Relaxed),
            samples_taken: self.stats.samples_taken.load(Ordering::Relaxed),
            entries_evicted: self.stats.entries_evicted.load(Ordering::Relaxed),
            skipped_in_progress: self.stats.skipped_in_progress.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EvictionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
