use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::resource::{snapshot, MonitoredResource, ResourceSnapshot};
use crate::threshold::{EvictionThreshold, PressureFlags};

/// Consumer of threshold transitions. Each callback fires exactly once
/// per edge, not on every sample above the threshold.
pub trait ResourceListener: Send + Sync {
    fn request_throttle(&self, resource: &str, sample: ResourceSnapshot);
    fn cancel_throttle(&self, resource: &str);
    fn request_eviction(&self, resource: &str, sample: ResourceSnapshot);
    fn cancel_eviction(&self, resource: &str);
    fn request_stop(&self, resource: &str, sample: ResourceSnapshot);
    fn cancel_stop(&self, resource: &str);
}

/// Fire-and-forget operator notifications; observability only, no
/// backpressure from this channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorEvent {
    NearCapacity { resource: String },
    FullCapacity { resource: String },
    Normal { resource: String },
}

pub trait OperatorEventSink: Send + Sync {
    fn fire(&self, event: OperatorEvent);
}

#[derive(Debug, Clone)]
pub struct ResourceMonitorConfig {
    /// Baseline polling interval when the resource is idle.
    pub poll_interval: Duration,
    /// Floor under adaptive shrinking, so a full resource cannot spin
    /// the poller.
    pub min_poll_interval: Duration,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            min_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Polling frequency rises non-linearly as reserved usage approaches
/// capacity: `interval × (1 − sin(reserved·π / (2·total)))`. Dense
/// sampling near capacity, sparse sampling when idle.
pub fn adaptive_interval(base: Duration, reserved: u64, total: u64) -> Duration {
    let total = total.max(1);
    let reserved = reserved.min(total);
    let scale = 1.0 - (reserved as f64 * PI / (2.0 * total as f64)).sin();
    base.mul_f64(scale.clamp(0.0, 1.0))
}

struct Watched {
    resource: Arc<dyn MonitoredResource>,
    threshold: EvictionThreshold,
    last: PressureFlags,
}

struct MonitorShared {
    watched: Mutex<Vec<Watched>>,
    listeners: Mutex<Vec<Arc<dyn ResourceListener>>>,
    operator: Mutex<Option<Arc<dyn OperatorEventSink>>>,
    config: ResourceMonitorConfig,
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// Background poller over monitored resources.
///
/// Samples each resource once per tick (the snapshot is the per-tick
/// memoization), classifies against the tier selected at registration
/// time, and edge-triggers listener callbacks. `poll_once` is public so
/// tests and callers that own their own timer can drive it
/// deterministically.
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    poller: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                watched: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                operator: Mutex::new(None),
                config,
                stop: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Registers a resource, selecting its threshold tier once from the
    /// current total capacity.
    pub fn watch(&self, resource: Arc<dyn MonitoredResource>) {
        let threshold = EvictionThreshold::for_total(resource.total());
        self.watch_with_threshold(resource, threshold);
    }

    /// Registers a resource against an explicit threshold instead of the
    /// size-selected tier.
    pub fn watch_with_threshold(
        &self,
        resource: Arc<dyn MonitoredResource>,
        threshold: EvictionThreshold,
    ) {
        tracing::info!(
            target = "strata.resource",
            resource = resource.name(),
            tier = threshold.name,
            total = resource.total(),
            "monitoring resource"
        );
        self.shared.watched.lock().push(Watched {
            resource,
            threshold,
            last: PressureFlags::default(),
        });
    }

    pub fn add_listener(&self, listener: Arc<dyn ResourceListener>) {
        self.shared.listeners.lock().push(listener);
    }

    pub fn set_operator_sink(&self, sink: Arc<dyn OperatorEventSink>) {
        *self.shared.operator.lock() = Some(sink);
    }

    /// Samples every watched resource once and fires edge transitions.
    /// Returns the interval until the next poll is due.
    pub fn poll_once(&self) -> Duration {
        Self::poll_watched(&self.shared)
    }

    fn poll_watched(shared: &MonitorShared) -> Duration {
        let mut next = shared.config.poll_interval;
        let mut transitions: Vec<(String, PressureFlags, PressureFlags, ResourceSnapshot)> =
            Vec::new();
        {
            let mut watched = shared.watched.lock();
            for entry in watched.iter_mut() {
                let sample = snapshot(entry.resource.as_ref());
                let flags = entry.threshold.classify(entry.resource.kind(), sample);
                if flags != entry.last {
                    transitions.push((
                        entry.resource.name().to_string(),
                        entry.last,
                        flags,
                        sample,
                    ));
                    entry.last = flags;
                }
                let due = adaptive_interval(
                    shared.config.poll_interval,
                    sample.reserved.max(sample.used),
                    sample.total,
                );
                next = next.min(due.max(shared.config.min_poll_interval));
            }
        }

        // Listener callbacks run outside the watched lock; a listener is
        // allowed to call back into the monitor.
        let listeners = shared.listeners.lock().clone();
        for (name, before, after, sample) in transitions {
            tracing::info!(
                target = "strata.resource",
                resource = %name,
                ?before,
                ?after,
                used = sample.used,
                reserved = sample.reserved,
                total = sample.total,
                "resource pressure transition"
            );
            for listener in &listeners {
                if after.evict != before.evict {
                    if after.evict {
                        listener.request_eviction(&name, sample);
                    } else {
                        listener.cancel_eviction(&name);
                    }
                }
                if after.throttle != before.throttle {
                    if after.throttle {
                        listener.request_throttle(&name, sample);
                    } else {
                        listener.cancel_throttle(&name);
                    }
                }
                if after.stop != before.stop {
                    if after.stop {
                        listener.request_stop(&name, sample);
                    } else {
                        listener.cancel_stop(&name);
                    }
                }
            }
            Self::fire_operator_event(shared, &name, before, after);
        }
        next
    }

    fn fire_operator_event(
        shared: &MonitorShared,
        name: &str,
        before: PressureFlags,
        after: PressureFlags,
    ) {
        let sink = shared.operator.lock().clone();
        let Some(sink) = sink else { return };
        let event = if after.stop {
            OperatorEvent::FullCapacity { resource: name.to_string() }
        } else if after.throttle || after.evict {
            OperatorEvent::NearCapacity { resource: name.to_string() }
        } else if before.evict || before.throttle || before.stop {
            OperatorEvent::Normal { resource: name.to_string() }
        } else {
            return;
        };
        sink.fire(event);
    }

    /// Spawns the background polling thread. Idempotent.
    pub fn start(&self) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        *self.shared.stop.lock() = false;
        let shared = self.shared.clone();
        *poller = Some(
            std::thread::Builder::new()
                .name("strata-resource-poller".to_string())
                .spawn(move || loop {
                    let next = Self::poll_watched(&shared);
                    let mut stop = shared.stop.lock();
                    if *stop {
                        return;
                    }
                    shared.wakeup.wait_for(&mut stop, next);
                    if *stop {
                        return;
                    }
                })
                .unwrap_or_else(|err| panic!("failed to spawn resource poller: {err}")),
        );
    }

    pub fn stop(&self) {
        let handle = {
            let mut poller = self.poller.lock();
            *self.shared.stop.lock() = true;
            self.shared.wakeup.notify_all();
            poller.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
