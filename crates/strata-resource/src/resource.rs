use serde::{Deserialize, Serialize};

/// The kind of pool a monitored resource represents. Offheap and disk
/// pools are classified by vital-remaining / reserved-fraction tests
/// rather than the general heap threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Heap,
    Offheap,
    Disk,
}

/// Read-only view of a memory/storage pool, written by the runtime or
/// storage layer. All values are bytes.
pub trait MonitoredResource: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ResourceKind;
    fn total(&self) -> u64;
    fn used(&self) -> u64;
    /// Memory claimed but not necessarily touched yet (e.g. offheap
    /// reservations). Always >= used for pools that track it.
    fn reserved(&self) -> u64;
    /// Memory the pool must keep free to stay operable.
    fn vital(&self) -> u64;
}

/// One reading of a resource, taken once per polling tick so the
/// (potentially expensive) underlying queries are not repeated by every
/// consumer within the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub total: u64,
    pub used: u64,
    pub reserved: u64,
    pub vital: u64,
}

impl ResourceSnapshot {
    pub fn used_fraction(&self) -> f64 {
        self.used as f64 / self.total.max(1) as f64
    }

    pub fn reserved_fraction(&self) -> f64 {
        self.reserved as f64 / self.total.max(1) as f64
    }

    pub fn vital_remaining(&self) -> u64 {
        self.total.saturating_sub(self.reserved)
    }
}

pub fn snapshot(resource: &dyn MonitoredResource) -> ResourceSnapshot {
    ResourceSnapshot {
        total: resource.total(),
        used: resource.used(),
        reserved: resource.reserved(),
        vital: resource.vital(),
    }
}
