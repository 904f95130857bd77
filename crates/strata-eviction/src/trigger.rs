use std::time::Instant;

use strata_core::ObjectId;
use strata_object::{EvictableMap, SampledEntry};

use crate::client::ClientObjectReferenceSet;

/// Hard cap on any single sample request.
pub const MAX_SAMPLE_SIZE: usize = 100_000;

/// Clamps a requested sample size to `[0, MAX_SAMPLE_SIZE]`.
pub fn bounds_check_sample_size(requested: i64) -> usize {
    requested.clamp(0, MAX_SAMPLE_SIZE as i64) as usize
}

/// Computes how long until a map entry's value expires, faulting the
/// value object as needed. Implemented by the eviction engine; `<= 0`
/// means already expired. Values that carry no timestamps expire
/// immediately (an eternal cache sheds entries freely under capacity
/// pressure).
pub trait EntryExpiryProbe {
    fn expires_in(&self, value: ObjectId, tti_seconds: i64, ttl_seconds: i64) -> i64;
}

/// One eviction attempt against one map. Triggers are single-use:
/// created fresh per attempt and discarded after `complete_eviction`.
///
/// Lifecycle: fresh → started → (sampled) → completed.
pub trait EvictionTrigger: Send {
    fn name(&self) -> &'static str;

    /// Claims the map's eviction flag. Returns false when there is
    /// nothing to do (empty map) or another pass is already running.
    fn start_eviction(&mut self, map: &dyn EvictableMap) -> bool;

    /// Strategy-specific sampling. An empty return means this attempt
    /// produces no eviction context.
    fn collect_candidates(
        &mut self,
        map: &dyn EvictableMap,
        clients: &dyn ClientObjectReferenceSet,
        probe: &dyn EntryExpiryProbe,
        now: i64,
    ) -> Vec<SampledEntry>;

    /// Ends the attempt. If this trigger claimed the map's eviction flag
    /// and produced no candidates, the flag is cleared here; a produced
    /// context leaves the flag set for the removal transaction's
    /// completion to clear.
    fn complete_eviction(&mut self, map: &dyn EvictableMap);
}

/// Shared lifecycle bookkeeping embedded by each strategy struct.
#[derive(Debug)]
pub struct TriggerLifecycle {
    started: bool,
    claimed_flag: bool,
    produced: bool,
    started_at: Option<Instant>,
    start_size: usize,
}

impl Default for TriggerLifecycle {
    fn default() -> Self {
        Self {
            started: false,
            claimed_flag: false,
            produced: false,
            started_at: None,
            start_size: 0,
        }
    }
}

impl TriggerLifecycle {
    pub fn start(&mut self, map: &dyn EvictableMap) -> bool {
        assert!(!self.started, "eviction trigger started twice");
        let size = map.size();
        if size == 0 {
            return false;
        }
        if !map.start_eviction() {
            return false;
        }
        self.started = true;
        self.claimed_flag = true;
        self.started_at = Some(Instant::now());
        self.start_size = size;
        true
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn start_size(&self) -> usize {
        self.start_size
    }

    pub fn mark_produced(&mut self, samples: &[SampledEntry]) {
        self.produced = !samples.is_empty();
    }

    pub fn complete(&mut self, name: &'static str, map: &dyn EvictableMap) {
        assert!(self.started, "completing an eviction trigger that never started");
        if self.claimed_flag && !self.produced {
            map.eviction_completed();
        }
        if let Some(started_at) = self.started_at {
            tracing::debug!(
                target = "strata.eviction",
                trigger = name,
                cache = map.cache_name(),
                start_size = self.start_size,
                end_size = map.size(),
                produced = self.produced,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "eviction attempt finished"
            );
        }
    }
}

/// Critical-pressure strategy: ignores capacity math and samples either
/// the whole map (`blowout`) or half of it.
pub struct EmergencyEvictionTrigger {
    run: TriggerLifecycle,
    blowout: bool,
}

impl EmergencyEvictionTrigger {
    pub fn new(blowout: bool) -> Self {
        Self {
            run: TriggerLifecycle::default(),
            blowout,
        }
    }
}

impl EvictionTrigger for EmergencyEvictionTrigger {
    fn name(&self) -> &'static str {
        "emergency"
    }

    fn start_eviction(&mut self, map: &dyn EvictableMap) -> bool {
        self.run.start(map)
    }

    fn collect_candidates(
        &mut self,
        map: &dyn EvictableMap,
        _clients: &dyn ClientObjectReferenceSet,
        _probe: &dyn EntryExpiryProbe,
        _now: i64,
    ) -> Vec<SampledEntry> {
        let size = map.size() as i64;
        let requested = bounds_check_sample_size(if self.blowout { size } else { size / 2 });
        // No client-referenced exclusion: shedding memory wins over
        // client locality in an emergency.
        let samples = map.random_samples(requested, &|_| false);
        self.run.mark_produced(&samples);
        samples
    }

    fn complete_eviction(&mut self, map: &dyn EvictableMap) {
        self.run.complete(self.name(), map);
    }
}

/// Gentle repeatable throttle during resource-pressure ramp-up: samples
/// `turns/10000` of the map per attempt.
pub struct BrakingEvictionTrigger {
    run: TriggerLifecycle,
    turns: u32,
}

impl BrakingEvictionTrigger {
    pub fn new(turns: u32) -> Self {
        Self {
            run: TriggerLifecycle::default(),
            turns,
        }
    }
}

impl EvictionTrigger for BrakingEvictionTrigger {
    fn name(&self) -> &'static str {
        "braking"
    }

    fn start_eviction(&mut self, map: &dyn EvictableMap) -> bool {
        self.run.start(map)
    }

    fn collect_candidates(
        &mut self,
        map: &dyn EvictableMap,
        clients: &dyn ClientObjectReferenceSet,
        _probe: &dyn EntryExpiryProbe,
        _now: i64,
    ) -> Vec<SampledEntry> {
        let size = map.size() as i64;
        let requested = bounds_check_sample_size(size * self.turns as i64 / 10_000);
        let samples = map.random_samples(requested, &|id| clients.contains(id));
        self.run.mark_produced(&samples);
        samples
    }

    fn complete_eviction(&mut self, map: &dyn EvictableMap) {
        self.run.complete(self.name(), map);
    }
}
