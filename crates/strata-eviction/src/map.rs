use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use strata_core::ObjectId;
use strata_object::{expires_in, EvictableEntry, EvictableMap, ManagedObjectState, SampledEntry};

/// Reference server-map state: a clustered cache's key → value-object
/// mapping with capacity and TTI/TTL settings.
#[derive(Serialize, Deserialize)]
pub struct ServerMapState {
    cache_name: String,
    max_total_count: usize,
    tti_seconds: i64,
    ttl_seconds: i64,
    entries: BTreeMap<String, ObjectId>,
    /// Runtime-only eviction mutual-exclusion flag; toggled under
    /// read-only checkouts, never persisted.
    #[serde(skip)]
    evicting: AtomicBool,
}

impl ServerMapState {
    pub fn new(
        cache_name: impl Into<String>,
        max_total_count: usize,
        tti_seconds: i64,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            max_total_count,
            tti_seconds,
            ttl_seconds,
            entries: BTreeMap::new(),
            evicting: AtomicBool::new(false),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ObjectId) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<ObjectId> {
        self.entries.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(payload)
    }

    /// Random offset into the entry ordering; entropy comes from the OS
    /// so repeated passes over the same map do not resample the same
    /// prefix.
    fn random_offset(&self) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let mut seed = [0u8; 8];
        if getrandom::getrandom(&mut seed).is_err() {
            return 0;
        }
        (u64::from_le_bytes(seed) % self.entries.len() as u64) as usize
    }
}

impl ManagedObjectState for ServerMapState {
    fn type_name(&self) -> &str {
        "server-map"
    }

    fn reachable_ids(&self) -> Vec<ObjectId> {
        self.entries.values().copied().collect()
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_else(|err| panic!("server map state encode: {err}"))
    }

    fn as_evictable(&self) -> Option<&dyn EvictableMap> {
        Some(self)
    }

    fn as_evictable_mut(&mut self) -> Option<&mut dyn EvictableMap> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl EvictableMap for ServerMapState {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn max_total_count(&self) -> usize {
        self.max_total_count
    }

    fn tti_seconds(&self) -> i64 {
        self.tti_seconds
    }

    fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    fn random_samples(
        &self,
        count: usize,
        exclude: &dyn Fn(ObjectId) -> bool,
    ) -> Vec<SampledEntry> {
        if count == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let offset = self.random_offset();
        let mut samples = Vec::with_capacity(count.min(self.entries.len()));
        for (key, &value) in self.entries.iter().cycle().skip(offset).take(self.entries.len()) {
            if samples.len() >= count {
                break;
            }
            if exclude(value) {
                continue;
            }
            samples.push(SampledEntry {
                key: key.clone(),
                value,
            });
        }
        samples
    }

    fn start_eviction(&self) -> bool {
        self.evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::Acquire)
    }

    fn eviction_completed(&self) {
        self.evicting.store(false, Ordering::Release);
    }

    fn remove_entries(&mut self, keys: &[String]) {
        for key in keys {
            self.entries.remove(key);
        }
    }
}

/// Reference cache-entry value state carrying the timestamps the
/// TTI/TTL filter needs.
#[derive(Serialize, Deserialize)]
pub struct CacheEntryState {
    created_at: i64,
    last_accessed: i64,
}

impl CacheEntryState {
    pub fn new(created_at: i64) -> Self {
        Self {
            created_at,
            last_accessed: created_at,
        }
    }

    pub fn touch(&mut self, now: i64) {
        self.last_accessed = now;
    }

    pub fn decode(payload: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(payload)
    }
}

impl ManagedObjectState for CacheEntryState {
    fn type_name(&self) -> &str {
        "cache-entry"
    }

    fn reachable_ids(&self) -> Vec<ObjectId> {
        Vec::new()
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_else(|err| panic!("cache entry state encode: {err}"))
    }

    fn as_evictable_entry(&self) -> Option<&dyn EvictableEntry> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl EvictableEntry for CacheEntryState {
    fn expires_in(&self, now: i64, tti_seconds: i64, ttl_seconds: i64) -> i64 {
        expires_in(
            now,
            self.created_at,
            self.last_accessed,
            tti_seconds,
            ttl_seconds,
        )
    }
}
