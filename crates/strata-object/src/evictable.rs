use strata_core::ObjectId;

/// One sampled map entry: the entry key and the object id of its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledEntry {
    pub key: String,
    pub value: ObjectId,
}

/// Capability of a server-map [`ManagedObjectState`](crate::ManagedObjectState)
/// that makes it a target for the eviction engine.
///
/// `start_eviction`/`eviction_completed` form a mutual-exclusion flag:
/// only one eviction pass may run against a map at a time.
pub trait EvictableMap {
    fn cache_name(&self) -> &str;
    fn size(&self) -> usize;
    /// 0 means unlimited.
    fn max_total_count(&self) -> usize;
    /// Time-to-idle in seconds; 0 means disabled.
    fn tti_seconds(&self) -> i64;
    /// Time-to-live in seconds; 0 means disabled.
    fn ttl_seconds(&self) -> i64;

    /// Up to `count` entries sampled at random, excluding entries whose
    /// value is currently referenced by a connected client.
    fn random_samples(&self, count: usize, exclude: &dyn Fn(ObjectId) -> bool)
        -> Vec<SampledEntry>;

    /// Claims the eviction flag. Returns false if an eviction pass is
    /// already in progress for this map. The flag is runtime-only state
    /// toggled under read-only checkouts, hence `&self`.
    fn start_eviction(&self) -> bool;
    fn is_evicting(&self) -> bool;
    fn eviction_completed(&self);

    /// Removes the given keys; the transactional removal applied by the
    /// downstream eviction transaction.
    fn remove_entries(&mut self, keys: &[String]);
}

/// Capability of an entry-value state that carries its own access and
/// creation timestamps for TTI/TTL math.
pub trait EvictableEntry {
    /// Seconds until this entry expires relative to `now`; zero or
    /// negative means already expired. An entry with neither TTI nor TTL
    /// expires immediately (eternal caches shed entries freely once
    /// capacity forces the issue).
    fn expires_in(&self, now: i64, tti_seconds: i64, ttl_seconds: i64) -> i64;
}

/// Default expiry math shared by entry states that track
/// `created_at`/`last_accessed` unix seconds.
pub fn expires_in(
    now: i64,
    created_at: i64,
    last_accessed: i64,
    tti_seconds: i64,
    ttl_seconds: i64,
) -> i64 {
    if tti_seconds <= 0 && ttl_seconds <= 0 {
        return 0;
    }
    let mut earliest = i64::MAX;
    if ttl_seconds > 0 {
        earliest = earliest.min(created_at + ttl_seconds);
    }
    if tti_seconds > 0 {
        earliest = earliest.min(last_accessed + tti_seconds);
    }
    earliest - now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eternal_entries_expire_immediately() {
        assert_eq!(expires_in(1_000, 0, 0, 0, 0), 0);
    }

    #[test]
    fn ttl_and_tti_take_the_earlier_deadline() {
        // Created at 0 with ttl 60, last touched at 40 with tti 10:
        // the idle deadline (50) is earlier than the live deadline (60).
        assert_eq!(expires_in(45, 0, 40, 10, 60), 5);
        // Past the idle deadline.
        assert!(expires_in(55, 0, 40, 10, 60) <= 0);
    }
}
