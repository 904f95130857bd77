//! Persistence collaborators for the Strata object-management core.
//!
//! The storage engine itself is not part of this core; what lives here is
//! the contract the object manager and the eviction engine program
//! against ([`ObjectStore`] / [`Transaction`]), an in-memory reference
//! implementation, and the [`RecoveryLog`] — the one genuinely durable
//! piece, holding in-flight eviction transactions and pending inline-GC
//! deletions across crashes.

mod error;
mod recovery;
mod store;

pub use error::StoreError;
pub use recovery::{EvictionRecord, RecoveryLog};
pub use store::{InMemoryObjectStore, ObjectStore, StoredObject, Transaction};
