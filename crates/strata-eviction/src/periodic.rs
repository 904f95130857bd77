use strata_object::{EvictableMap, SampledEntry};

use crate::client::ClientObjectReferenceSet;
use crate::trigger::{
    bounds_check_sample_size, EntryExpiryProbe, EvictionTrigger, TriggerLifecycle,
};

/// Periodic TTI/TTL sweep.
///
/// Samples a capacity-derived slice of the map, oversampled ×1.5, and
/// selects entries whose computed expiry has passed. When the map is
/// also over its count capacity the sweep additionally evicts live
/// entries up to the overshoot, nearest-to-expiration first — a priority
/// policy, not a random one.
pub struct PeriodicEvictionTrigger {
    run: TriggerLifecycle,
}

impl PeriodicEvictionTrigger {
    pub fn new() -> Self {
        Self {
            run: TriggerLifecycle::default(),
        }
    }

    fn sample_size(max_total_count: usize) -> usize {
        let derived = if max_total_count == 0 {
            0
        } else {
            (max_total_count / 10).min(1_000_000)
        };
        bounds_check_sample_size(derived.max(100) as i64)
    }
}

impl Default for PeriodicEvictionTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionTrigger for PeriodicEvictionTrigger {
    fn name(&self) -> &'static str {
        "periodic"
    }

    fn start_eviction(&mut self, map: &dyn EvictableMap) -> bool {
        let expiring = map.tti_seconds() > 0 || map.ttl_seconds() > 0;
        let max = map.max_total_count();
        let over_capacity = max > 0 && map.size() > max;
        if !expiring && !over_capacity {
            // Eternal and within bounds: a sweep would evict live data
            // for no reason.
            return false;
        }
        self.run.start(map)
    }

    fn collect_candidates(
        &mut self,
        map: &dyn EvictableMap,
        clients: &dyn ClientObjectReferenceSet,
        probe: &dyn EntryExpiryProbe,
        now: i64,
    ) -> Vec<SampledEntry> {
        let tti = map.tti_seconds();
        let ttl = map.ttl_seconds();
        let max = map.max_total_count();
        let size = map.size();

        let sample_size = Self::sample_size(max);
        let requested = bounds_check_sample_size((sample_size + sample_size / 2) as i64);
        let samples = map.random_samples(requested, &|id| clients.contains(id));

        let dump_live = max > 0 && size > max;
        let overshoot = if dump_live { size - max } else { 0 };

        let mut expired = Vec::new();
        let mut live: Vec<(i64, SampledEntry)> = Vec::new();
        for entry in samples {
            let expires_in = probe.expires_in(entry.value, tti, ttl);
            if expires_in <= 0 {
                expired.push(entry);
            } else if dump_live {
                live.push((expires_in, entry));
            }
        }

        let mut candidates = expired;
        if dump_live && candidates.len() < overshoot {
            live.sort_by_key(|(expires_in, _)| *expires_in);
            let need = overshoot - candidates.len();
            candidates.extend(live.into_iter().take(need).map(|(_, entry)| entry));
        }

        self.run.mark_produced(&candidates);
        candidates
    }

    fn complete_eviction(&mut self, map: &dyn EvictableMap) {
        self.run.complete(self.name(), map);
    }
}
