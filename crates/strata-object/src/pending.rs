use std::collections::HashMap;
use std::sync::Arc;

use strata_core::{NodeId, ObjectId};

use crate::lookup::{LookupRequest, LookupResponder};

/// One parked lookup, carried across retries so the contention warning
/// cadence can count attempts.
pub(crate) struct ParkedLookup {
    pub node: NodeId,
    pub request: LookupRequest,
    pub responder: Arc<dyn LookupResponder>,
    pub max_reachable: usize,
    pub retries: u32,
}

/// Requests waiting for the object manager: `ready` holds requests due
/// for a retry (drained FIFO after each release), `blocked` holds
/// requests parked on the specific object id that failed to mark.
#[derive(Default)]
pub(crate) struct PendingQueue {
    ready: Vec<ParkedLookup>,
    blocked: HashMap<ObjectId, Vec<ParkedLookup>>,
    blocked_count: usize,
}

impl PendingQueue {
    pub fn park_blocked(&mut self, blocking_id: ObjectId, lookup: ParkedLookup) {
        self.blocked.entry(blocking_id).or_default().push(lookup);
        self.blocked_count += 1;
    }

    pub fn park_ready(&mut self, lookup: ParkedLookup) {
        self.ready.push(lookup);
    }

    /// Moves every request blocked on `id` to the ready list, preserving
    /// registration order.
    pub fn unblock(&mut self, id: ObjectId) {
        if let Some(parked) = self.blocked.remove(&id) {
            self.blocked_count -= parked.len();
            self.ready.extend(parked);
        }
    }

    pub fn drain_ready(&mut self) -> Vec<ParkedLookup> {
        std::mem::take(&mut self.ready)
    }

    pub fn total_len(&self) -> usize {
        self.ready.len() + self.blocked_count
    }
}
