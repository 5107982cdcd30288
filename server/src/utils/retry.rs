//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule with jitter.
///
/// Delays double from `base` up to `max`; each delay is multiplied by a
/// random factor in [0.5, 1.5) so that competing consumers spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Next delay in the schedule, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);

        let raw = self
            .base
            .saturating_mul(2_u32.saturating_pow(exp))
            .min(self.max);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        raw.mul_f64(jitter)
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        // Jitter is [0.5, 1.5), so bound-check rather than compare exactly.
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(500) && first < Duration::from_millis(1500));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_secs(45));
        assert!(capped >= Duration::from_secs(15));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }
}
