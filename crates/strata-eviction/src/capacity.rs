use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strata_object::{EvictableMap, SampledEntry};

use crate::client::ClientObjectReferenceSet;
use crate::trigger::{
    bounds_check_sample_size, EntryExpiryProbe, EvictionTrigger, TriggerLifecycle,
};

/// Fires when a map's size exceeds its max-total-count and samples
/// exactly the overshoot.
///
/// When client-referenced exclusion starves the sample, the trigger
/// registers for a client-set refresh and retries once, waking every
/// two seconds rather than waiting indefinitely.
pub struct CapacityEvictionTrigger {
    run: TriggerLifecycle,
    client_wait: Duration,
}

impl CapacityEvictionTrigger {
    pub fn new() -> Self {
        Self::with_client_wait(Duration::from_secs(2))
    }

    pub fn with_client_wait(client_wait: Duration) -> Self {
        Self {
            run: TriggerLifecycle::default(),
            client_wait,
        }
    }

    fn sample(
        map: &dyn EvictableMap,
        clients: &dyn ClientObjectReferenceSet,
        target: usize,
    ) -> Vec<SampledEntry> {
        map.random_samples(target, &|id| clients.contains(id))
    }
}

impl Default for CapacityEvictionTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionTrigger for CapacityEvictionTrigger {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn start_eviction(&mut self, map: &dyn EvictableMap) -> bool {
        let max = map.max_total_count();
        if max == 0 || map.size() <= max {
            return false;
        }
        self.run.start(map)
    }

    fn collect_candidates(
        &mut self,
        map: &dyn EvictableMap,
        clients: &dyn ClientObjectReferenceSet,
        _probe: &dyn EntryExpiryProbe,
        _now: i64,
    ) -> Vec<SampledEntry> {
        let max = map.max_total_count();
        let size = map.size();
        if max == 0 || size <= max {
            // Raced back under capacity between start and collect.
            self.run.mark_produced(&[]);
            return Vec::new();
        }
        let target = bounds_check_sample_size((size - max) as i64);
        let mut samples = Self::sample(map, clients, target);

        if samples.len() < target {
            // Too much of the map is faulted into clients; wait for the
            // reference set to refresh and try once more.
            tracing::debug!(
                target = "strata.eviction",
                cache = map.cache_name(),
                wanted = target,
                got = samples.len(),
                "capacity sample starved by client references; waiting for refresh"
            );
            let signal = Arc::new((Mutex::new(false), Condvar::new()));
            {
                let signal = signal.clone();
                clients.add_refresh_listener(Arc::new(move || {
                    let (refreshed, cv) = &*signal;
                    *refreshed.lock() = true;
                    cv.notify_all();
                }));
            }
            let (refreshed, cv) = &*signal;
            let mut guard = refreshed.lock();
            if !*guard {
                let _ = cv.wait_for(&mut guard, self.client_wait);
            }
            drop(guard);
            samples = Self::sample(map, clients, target);
        }

        self.run.mark_produced(&samples);
        samples
    }

    fn complete_eviction(&mut self, map: &dyn EvictableMap) {
        self.run.complete(self.name(), map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NoClientReferences;
    use crate::map::ServerMapState;
    use strata_core::ObjectId;

    struct ExpireNever;

    impl EntryExpiryProbe for ExpireNever {
        fn expires_in(&self, _value: ObjectId, _tti: i64, _ttl: i64) -> i64 {
            i64::MAX
        }
    }

    fn map_sized(size: usize, max: usize) -> ServerMapState {
        let mut map = ServerMapState::new("cache", max, 0, 0);
        for i in 0..size {
            map.insert(format!("k{i}"), ObjectId::new(i as i64));
        }
        map
    }

    #[test]
    fn samples_exactly_the_overshoot() {
        let map = map_sized(130, 100);
        let mut trigger = CapacityEvictionTrigger::new();
        assert!(trigger.start_eviction(&map));
        let samples =
            trigger.collect_candidates(&map, &NoClientReferences, &ExpireNever, 0);
        assert_eq!(samples.len(), 30);
        trigger.complete_eviction(&map);
        assert!(map.is_evicting());
    }

    #[test]
    fn does_not_fire_at_or_under_capacity() {
        let map = map_sized(100, 100);
        let mut trigger = CapacityEvictionTrigger::new();
        assert!(!trigger.start_eviction(&map));
        assert!(!map.is_evicting());
    }

    #[test]
    fn unlimited_maps_never_fire() {
        let map = map_sized(1000, 0);
        let mut trigger = CapacityEvictionTrigger::new();
        assert!(!trigger.start_eviction(&map));
    }

    struct EverythingReferenced;

    impl ClientObjectReferenceSet for EverythingReferenced {
        fn contains(&self, _id: ObjectId) -> bool {
            true
        }
        fn add_refresh_listener(&self, _listener: Arc<dyn Fn() + Send + Sync>) {}
    }

    #[test]
    fn starved_sample_retries_once_then_gives_up() {
        let map = map_sized(110, 100);
        let mut trigger = CapacityEvictionTrigger::with_client_wait(Duration::from_millis(10));
        assert!(trigger.start_eviction(&map));
        let samples =
            trigger.collect_candidates(&map, &EverythingReferenced, &ExpireNever, 0);
        assert!(samples.is_empty());
        trigger.complete_eviction(&map);
        // Nothing produced: the flag clears so a later pass can run.
        assert!(!map.is_evicting());
    }
}
