//! Dependency readiness tracking
//!
//! `/ready` reports healthy only when both the key directory and the event
//! bus have completed an operation successfully inside the readiness window.
//! Successes are recorded by the ingest path and by a background probe so an
//! idle process still reports ready.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::constants::READINESS_WINDOW_SECS;

#[derive(Default)]
struct Inner {
    keydir_ok: Mutex<Option<Instant>>,
    bus_ok: Mutex<Option<Instant>>,
}

/// Process-wide readiness state, cheap to clone.
#[derive(Clone, Default)]
pub struct ReadinessTracker {
    inner: Arc<Inner>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_keydir_ok(&self) {
        *self.inner.keydir_ok.lock() = Some(Instant::now());
    }

    pub fn record_bus_ok(&self) {
        *self.inner.bus_ok.lock() = Some(Instant::now());
    }

    pub fn is_ready(&self) -> bool {
        let window = Duration::from_secs(READINESS_WINDOW_SECS);
        let fresh = |slot: &Mutex<Option<Instant>>| {
            slot.lock().map(|t| t.elapsed() <= window).unwrap_or(false)
        };
        fresh(&self.inner.keydir_ok) && fresh(&self.inner.bus_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_until_both_recorded() {
        let tracker = ReadinessTracker::new();
        assert!(!tracker.is_ready());

        tracker.record_keydir_ok();
        assert!(!tracker.is_ready());

        tracker.record_bus_ok();
        assert!(tracker.is_ready());
    }
}
