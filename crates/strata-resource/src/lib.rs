//! Resource monitoring and write backpressure for Strata.
//!
//! A background poller samples monitored memory/storage pools at an
//! adaptive interval, classifies usage against a size-tiered threshold,
//! and emits edge-triggered throttle/evict/stop signals. The
//! [`WriteThrottle`] is the surface the write path consults; "stop" is
//! the one case where resource pressure becomes a caller-visible error,
//! by design.

mod monitor;
mod resource;
mod threshold;
mod throttle;

pub use monitor::{
    adaptive_interval, OperatorEvent, OperatorEventSink, ResourceListener, ResourceMonitor,
    ResourceMonitorConfig,
};
pub use resource::{snapshot, MonitoredResource, ResourceKind, ResourceSnapshot};
pub use threshold::{EvictionThreshold, PressureFlags};
pub use throttle::{ResourceExhausted, WriteThrottle};
