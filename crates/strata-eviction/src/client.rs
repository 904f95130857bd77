use std::sync::Arc;

use strata_core::ObjectId;

/// Which objects are currently faulted into connected clients.
///
/// Eviction sampling is biased away from entries a client is actively
/// using; the refresh notification lets the capacity trigger retry once
/// the set changes instead of giving up on an undersized sample.
pub trait ClientObjectReferenceSet: Send + Sync {
    fn contains(&self, id: ObjectId) -> bool;
    fn add_refresh_listener(&self, listener: Arc<dyn Fn() + Send + Sync>);
}

/// No connected clients; nothing is excluded from sampling.
#[derive(Default)]
pub struct NoClientReferences;

impl ClientObjectReferenceSet for NoClientReferences {
    fn contains(&self, _id: ObjectId) -> bool {
        false
    }

    fn add_refresh_listener(&self, _listener: Arc<dyn Fn() + Send + Sync>) {}
}
