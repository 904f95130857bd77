use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strata_resource::{ResourceListener, ResourceSnapshot, WriteThrottle};

use crate::engine::EvictionEngine;
use crate::trigger::{BrakingEvictionTrigger, EmergencyEvictionTrigger, EvictionTrigger};

#[derive(Debug, Clone)]
pub struct ProgressiveEvictionManagerConfig {
    /// Turns of braking before escalating to emergency sampling.
    pub emergency_after_turns: u32,
    /// Turns before emergency sampling escalates to a full blowout.
    pub blowout_after_turns: u32,
    /// Delay between escalation turns.
    pub turn_interval: Duration,
    /// Write slow-down applied while the ladder is engaged.
    pub throttle_fraction: f64,
}

impl Default for ProgressiveEvictionManagerConfig {
    fn default() -> Self {
        Self {
            emergency_after_turns: 3,
            blowout_after_turns: 10,
            turn_interval: Duration::from_secs(2),
            throttle_fraction: 0.75,
        }
    }
}

struct Inner {
    engine: Arc<EvictionEngine>,
    throttle: Arc<WriteThrottle>,
    config: ProgressiveEvictionManagerConfig,
    sweep_running: AtomicBool,
    escalating: Mutex<bool>,
    escalation_changed: Condvar,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

/// Walks the backpressure ladder in response to resource-monitor
/// transitions: normal → throttled → emergency-evicting → stopped, and
/// back down as pressure subsides.
///
/// Strategy selection lives here: ordinary pressure runs the normal
/// periodic/capacity sweep; sustained critical pressure runs braking
/// turns of rising intensity, then emergency sampling, then blowout.
#[derive(Clone)]
pub struct ProgressiveEvictionManager {
    inner: Arc<Inner>,
}

impl ProgressiveEvictionManager {
    pub fn new(
        engine: Arc<EvictionEngine>,
        throttle: Arc<WriteThrottle>,
        config: ProgressiveEvictionManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                throttle,
                config,
                sweep_running: AtomicBool::new(false),
                escalating: Mutex::new(false),
                escalation_changed: Condvar::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn throttle(&self) -> &Arc<WriteThrottle> {
        &self.inner.throttle
    }

    pub fn is_escalating(&self) -> bool {
        *self.inner.escalating.lock()
    }

    /// Joins any finished worker threads and stops escalation.
    pub fn stop(&self) {
        {
            let mut escalating = self.inner.escalating.lock();
            *escalating = false;
            self.inner.escalation_changed.notify_all();
        }
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }

    fn spawn_sweep(&self) {
        if self.inner.sweep_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("strata-pressure-sweep".to_string())
            .spawn(move || {
                inner.engine.run_evictor();
                inner.sweep_running.store(false, Ordering::Release);
            })
            .unwrap_or_else(|err| panic!("failed to spawn eviction sweep: {err}"));
        self.inner.workers.lock().push(handle);
    }

    fn spawn_escalation(&self) {
        {
            let mut escalating = self.inner.escalating.lock();
            if *escalating {
                return;
            }
            *escalating = true;
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("strata-pressure-escalation".to_string())
            .spawn(move || {
                let mut turns: u32 = 0;
                loop {
                    {
                        let mut escalating = inner.escalating.lock();
                        if !*escalating {
                            return;
                        }
                        inner
                            .escalation_changed
                            .wait_for(&mut escalating, inner.config.turn_interval);
                        if !*escalating {
                            return;
                        }
                    }
                    turns += 1;
                    let evictable = inner.engine.manager().store().snapshot_evictable_object_ids();
                    tracing::info!(
                        target = "strata.eviction",
                        turns,
                        maps = evictable.len(),
                        "pressure escalation turn"
                    );
                    for map_id in evictable {
                        let mut trigger: Box<dyn EvictionTrigger> =
                            if turns >= inner.config.blowout_after_turns {
                                Box::new(EmergencyEvictionTrigger::new(true))
                            } else if turns >= inner.config.emergency_after_turns {
                                Box::new(EmergencyEvictionTrigger::new(false))
                            } else {
                                Box::new(BrakingEvictionTrigger::new(turns))
                            };
                        if let Err(err) = inner.engine.evict_on(map_id, trigger.as_mut()) {
                            tracing::error!(
                                target = "strata.eviction",
                                %map_id,
                                error = %err,
                                "escalation eviction failed"
                            );
                        }
                    }
                }
            })
            .unwrap_or_else(|err| panic!("failed to spawn pressure escalation: {err}"));
        self.inner.workers.lock().push(handle);
    }

    fn end_escalation(&self) {
        let mut escalating = self.inner.escalating.lock();
        if *escalating {
            *escalating = false;
            self.inner.escalation_changed.notify_all();
        }
    }
}

impl ResourceListener for ProgressiveEvictionManager {
    fn request_eviction(&self, resource: &str, sample: ResourceSnapshot) {
        tracing::info!(
            target = "strata.eviction",
            resource,
            used = sample.used,
            total = sample.total,
            "resource pressure requests eviction"
        );
        self.spawn_sweep();
    }

    fn cancel_eviction(&self, resource: &str) {
        tracing::info!(
            target = "strata.eviction",
            resource,
            "resource pressure eviction cleared"
        );
    }

    fn request_throttle(&self, resource: &str, sample: ResourceSnapshot) {
        tracing::warn!(
            target = "strata.eviction",
            resource,
            reserved = sample.reserved,
            total = sample.total,
            "engaging write throttle and pressure escalation"
        );
        self.inner
            .throttle
            .throttle(self.inner.config.throttle_fraction);
        self.spawn_escalation();
    }

    fn cancel_throttle(&self, resource: &str) {
        tracing::info!(
            target = "strata.eviction",
            resource,
            "write throttle cleared"
        );
        self.inner.throttle.clear_throttle();
        self.end_escalation();
    }

    fn request_stop(&self, resource: &str, sample: ResourceSnapshot) {
        tracing::error!(
            target = "strata.eviction",
            resource,
            used = sample.used,
            total = sample.total,
            "resource exhausted; stopping writes"
        );
        self.inner.throttle.stop(resource);
    }

    fn cancel_stop(&self, resource: &str) {
        tracing::warn!(
            target = "strata.eviction",
            resource,
            "write stop cleared"
        );
        self.inner.throttle.clear_stop();
    }
}
