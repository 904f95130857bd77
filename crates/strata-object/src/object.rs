use std::any::Any;
use std::sync::Arc;

use strata_core::{NodeId, ObjectId};
use strata_store::StoredObject;

use crate::evictable::{EvictableEntry, EvictableMap};
use crate::ObjectManagerError;

/// Payload of one managed object.
///
/// Implementations describe their outbound references (for reachability
/// expansion and the garbage collector's mark phase) and serialize
/// themselves for the store; the [`ObjectStateFactory`] reverses the
/// serialization.
pub trait ManagedObjectState: Send {
    fn type_name(&self) -> &str;
    /// Object ids this state points at.
    fn reachable_ids(&self) -> Vec<ObjectId>;
    fn encode(&self) -> Vec<u8>;
    /// The evictable-map capability, if this state is a server map.
    fn as_evictable(&self) -> Option<&dyn EvictableMap> {
        None
    }
    fn as_evictable_mut(&mut self) -> Option<&mut dyn EvictableMap> {
        None
    }
    /// The per-entry expiry capability, if this state is a cache entry
    /// value carrying its own timestamps.
    fn as_evictable_entry(&self) -> Option<&dyn EvictableEntry> {
        None
    }
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Creates and revives object state. Carried explicitly in
/// [`ServerContext`] rather than living in a process-wide registry so
/// several server instances can coexist in one process (tests do).
pub trait ObjectStateFactory: Send + Sync {
    /// Fresh state for a newly created object.
    fn new_state(&self, id: ObjectId) -> Box<dyn ManagedObjectState>;
    /// Revives state faulted from the store.
    fn decode(
        &self,
        type_name: &str,
        payload: &[u8],
    ) -> Result<Box<dyn ManagedObjectState>, ObjectManagerError>;
}

/// Explicit startup context shared by the object manager, the eviction
/// engine and the resource monitor.
pub struct ServerContext {
    pub node_id: NodeId,
    pub state_factory: Arc<dyn ObjectStateFactory>,
}

/// The authoritative in-memory representation of one shared object.
///
/// Owned exclusively by whichever thread currently holds its checkout;
/// otherwise parked inside the reference table. Checkout moves the value
/// out of the table and release moves it back, so exclusive ownership is
/// enforced by the type system rather than by convention.
pub struct ManagedObject {
    id: ObjectId,
    version: u64,
    is_new: bool,
    dirty: bool,
    state: Box<dyn ManagedObjectState>,
}

impl ManagedObject {
    /// A created-but-not-yet-committed object. Invisible to lookups that
    /// did not declare the id in their new-object set.
    pub fn new_object(id: ObjectId, state: Box<dyn ManagedObjectState>) -> Self {
        Self {
            id,
            version: 0,
            is_new: true,
            dirty: false,
            state,
        }
    }

    pub fn from_stored(
        factory: &dyn ObjectStateFactory,
        stored: StoredObject,
    ) -> Result<Self, ObjectManagerError> {
        let state = factory.decode(&stored.type_name, &stored.payload)?;
        Ok(Self {
            id: stored.id,
            version: stored.version,
            is_new: false,
            dirty: false,
            state,
        })
    }

    pub fn to_stored(&self) -> StoredObject {
        StoredObject {
            id: self.id,
            version: self.version,
            type_name: self.state.type_name().to_string(),
            evictable: self.state.as_evictable().is_some(),
            payload: self.state.encode(),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn clear_new(&mut self) {
        self.is_new = false;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn state(&self) -> &dyn ManagedObjectState {
        self.state.as_ref()
    }

    /// Mutable access dirties the object and bumps its version; the next
    /// release persists it.
    pub fn state_mut(&mut self) -> &mut dyn ManagedObjectState {
        if !self.dirty {
            self.dirty = true;
            self.version += 1;
        }
        self.state.as_mut()
    }
}

impl std::fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObject")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("is_new", &self.is_new)
            .field("dirty", &self.dirty)
            .field("type_name", &self.state.type_name())
            .finish()
    }
}
