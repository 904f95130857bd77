//! The Strata object manager: concurrent checkout/release over the
//! shared object table, the pending-lookup queue, and the garbage
//! collectors that coordinate with it.
//!
//! The checkout protocol is the single doorway to managed objects — the
//! eviction engine and the collectors go through it too, never around
//! it.

mod error;
mod evictable;
mod gc;
mod lookup;
mod manager;
mod object;
mod pending;
mod reference;

pub use error::ObjectManagerError;
pub use evictable::{expires_in, EvictableEntry, EvictableMap, SampledEntry};
pub use gc::{
    GarbageCollector, GcDriver, GcStats, InlineGarbageCollector, MarkSweepCollector,
    NullGarbageCollector,
};
pub use lookup::{
    AccessLevel, LookupRequest, LookupResponder, LookupResults, MissingObjects, WaitForLookup,
};
pub use manager::{ObjectManager, ObjectManagerConfig, ObjectManagerStats};
pub use object::{ManagedObject, ManagedObjectState, ObjectStateFactory, ServerContext};
pub use reference::{CheckoutState, ObjectReference, ReferenceTable};
