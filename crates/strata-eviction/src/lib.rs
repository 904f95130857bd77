//! Server-map eviction for Strata: sampling trigger strategies, the
//! eviction engine that turns samples into transactional removals, and
//! the progressive eviction manager that walks the backpressure ladder
//! under resource pressure.
//!
//! Everything here operates through the object manager's checkout
//! protocol — the engine never touches a map it has not checked out.

mod capacity;
mod client;
mod engine;
mod map;
mod periodic;
mod progressive;
mod trigger;

pub use capacity::CapacityEvictionTrigger;
pub use client::{ClientObjectReferenceSet, NoClientReferences};
pub use engine::{
    EvictionEngine, EvictionEngineConfig, EvictionError, EvictionStats, ServerMapEvictionTransaction,
    TransactionBatchSink,
};
pub use map::{CacheEntryState, ServerMapState};
pub use periodic::PeriodicEvictionTrigger;
pub use progressive::{ProgressiveEvictionManager, ProgressiveEvictionManagerConfig};
pub use trigger::{
    bounds_check_sample_size, BrakingEvictionTrigger, EmergencyEvictionTrigger, EntryExpiryProbe,
    EvictionTrigger, TriggerLifecycle, MAX_SAMPLE_SIZE,
};
