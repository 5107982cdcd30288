//! Rolling duration statistics
//!
//! Windowed Welford mean/variance over the last N observations per span
//! name, used by the duration-outlier rule.

use std::collections::VecDeque;

/// Window size per span name
pub const WINDOW_SIZE: usize = 512;

/// Minimum observations before outliers are flagged
pub const MIN_SAMPLES: usize = 32;

/// Welford mean/variance over a sliding window
#[derive(Debug, Default)]
pub struct RollingStats {
    window: VecDeque<f64>,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        (self.m2 / (n - 1) as f64).max(0.0).sqrt()
    }

    /// Add an observation, evicting the oldest beyond the window.
    pub fn push(&mut self, value: f64) {
        if self.window.len() == WINDOW_SIZE
            && let Some(oldest) = self.window.pop_front()
        {
            // Welford removal: shrink the running mean and M2.
            let n = self.window.len() as f64 + 1.0;
            let mean_without = if n > 1.0 {
                (n * self.mean - oldest) / (n - 1.0)
            } else {
                0.0
            };
            self.m2 -= (oldest - self.mean) * (oldest - mean_without);
            self.mean = mean_without;
        }

        self.window.push_back(value);
        let n = self.window.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    /// True when `value` exceeds mean + 3 stddev with enough samples.
    pub fn is_outlier(&self, value: f64) -> bool {
        self.len() >= MIN_SAMPLES && value > self.mean + 3.0 * self.stddev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_stddev() {
        let mut stats = RollingStats::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.push(v);
        }
        assert!((stats.mean() - 5.0).abs() < 1e-9);
        // Sample stddev of that set is ~2.138
        assert!((stats.stddev() - 2.1380899).abs() < 1e-6);
    }

    #[test]
    fn test_no_outlier_below_min_samples() {
        let mut stats = RollingStats::default();
        for _ in 0..(MIN_SAMPLES - 1) {
            stats.push(10.0);
        }
        assert!(!stats.is_outlier(10_000.0));
        stats.push(10.0);
        assert!(stats.is_outlier(10_000.0));
    }

    #[test]
    fn test_outlier_threshold() {
        let mut stats = RollingStats::default();
        // Alternate 90/110 so stddev is ~10 around mean 100.
        for i in 0..100 {
            stats.push(if i % 2 == 0 { 90.0 } else { 110.0 });
        }
        assert!(!stats.is_outlier(120.0));
        assert!(stats.is_outlier(200.0));
    }

    #[test]
    fn test_window_slides() {
        let mut stats = RollingStats::default();
        for _ in 0..WINDOW_SIZE {
            stats.push(1.0);
        }
        assert_eq!(stats.len(), WINDOW_SIZE);

        // Push a new regime; the window stays bounded and the mean moves.
        for _ in 0..WINDOW_SIZE {
            stats.push(100.0);
        }
        assert_eq!(stats.len(), WINDOW_SIZE);
        assert!((stats.mean() - 100.0).abs() < 1e-6);
        assert!(stats.stddev() < 1e-3);
    }
}
