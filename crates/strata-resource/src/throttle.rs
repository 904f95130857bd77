use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

/// Raised synchronously into the write path while a full write-stop is
/// engaged. This is deliberate backpressure, not an internal failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("writes stopped: resource {resource} exhausted")]
pub struct ResourceExhausted {
    pub resource: String,
}

#[derive(Debug, Default)]
struct ThrottleState {
    /// 0.0 = unthrottled; 1.0 = maximally slowed.
    fraction: f64,
    stopped_by: Option<String>,
}

/// The write-path surface of the backpressure ladder.
///
/// Writers call [`WriteThrottle::check_write_allowed`] before applying a
/// transaction and sleep for [`WriteThrottle::delay`] when throttled.
#[derive(Debug, Default)]
pub struct WriteThrottle {
    state: Mutex<ThrottleState>,
    /// Delay applied at fraction 1.0.
    max_delay: Duration,
}

impl WriteThrottle {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(ThrottleState::default()),
            max_delay,
        }
    }

    pub fn throttle(&self, fraction: f64) {
        let mut state = self.state.lock();
        state.fraction = fraction.clamp(0.0, 1.0);
    }

    pub fn clear_throttle(&self) {
        self.state.lock().fraction = 0.0;
    }

    pub fn stop(&self, resource: &str) {
        let mut state = self.state.lock();
        if state.stopped_by.is_none() {
            state.stopped_by = Some(resource.to_string());
        }
    }

    pub fn clear_stop(&self) {
        self.state.lock().stopped_by = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped_by.is_some()
    }

    pub fn is_throttled(&self) -> bool {
        self.state.lock().fraction > 0.0
    }

    /// The slow-down a writer should absorb before proceeding, if any.
    pub fn delay(&self) -> Option<Duration> {
        let fraction = self.state.lock().fraction;
        if fraction <= 0.0 {
            return None;
        }
        Some(self.max_delay.mul_f64(fraction))
    }

    /// Fails with [`ResourceExhausted`] while a write-stop is engaged.
    pub fn check_write_allowed(&self) -> Result<(), ResourceExhausted> {
        match &self.state.lock().stopped_by {
            Some(resource) => Err(ResourceExhausted {
                resource: resource.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_fails_writes_until_cleared() {
        let throttle = WriteThrottle::new(Duration::from_millis(100));
        assert!(throttle.check_write_allowed().is_ok());

        throttle.stop("heap");
        let err = throttle.check_write_allowed().unwrap_err();
        assert_eq!(err.resource, "heap");

        throttle.clear_stop();
        assert!(throttle.check_write_allowed().is_ok());
    }

    #[test]
    fn first_stop_wins_attribution() {
        let throttle = WriteThrottle::new(Duration::from_millis(100));
        throttle.stop("heap");
        throttle.stop("disk");
        assert_eq!(throttle.check_write_allowed().unwrap_err().resource, "heap");
    }

    #[test]
    fn delay_scales_with_fraction() {
        let throttle = WriteThrottle::new(Duration::from_millis(100));
        assert_eq!(throttle.delay(), None);

        throttle.throttle(0.5);
        assert_eq!(throttle.delay(), Some(Duration::from_millis(50)));

        throttle.clear_throttle();
        assert_eq!(throttle.delay(), None);
    }
}
