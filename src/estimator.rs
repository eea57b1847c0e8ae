//! Round-trip latency estimation
//!
//! Exponential moving average over probe round trips. The value lives in an
//! `AtomicU64` as `f64` bits: the scheduler is the only writer, the heartbeat
//! producer reads it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Smoothing factor used when none is configured
pub const DEFAULT_ALPHA: f64 = 0.1;

/// Latency estimator with O(1) memory
#[derive(Debug)]
pub struct LatencyEstimator {
    /// Running average in nanoseconds, stored as `f64` bits
    average: AtomicU64,
    alpha: f64,
}

impl LatencyEstimator {
    /// Create estimator starting at zero
    pub fn new(alpha: f64) -> Self {
        Self {
            average: AtomicU64::new(0f64.to_bits()),
            alpha,
        }
    }

    /// Blend one round-trip sample into the average:
    /// `average = average * (1 - alpha) + sample * alpha / 2`
    #[inline]
    pub fn update(&self, sample_nanos: u64) -> f64 {
        let updated = self.average() * (1.0 - self.alpha) + sample_nanos as f64 * self.alpha / 2.0;
        self.average.store(updated.to_bits(), Ordering::Relaxed);
        updated
    }

    /// Current estimate in nanoseconds
    #[inline]
    pub fn average(&self) -> f64 {
        f64::from_bits(self.average.load(Ordering::Relaxed))
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

/// Wall-clock time in nanoseconds since the Unix epoch
pub fn wall_clock_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |n| n.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_damped() {
        let est = LatencyEstimator::default();
        assert_eq!(est.average(), 0.0);

        let avg = est.update(1_000);
        assert!((avg - 50.0).abs() < 1e-9);
        assert_eq!(avg, est.average());
    }

    #[test]
    fn test_matches_direct_recurrence() {
        let samples = [12_000_000u64, 9_500_000, 30_000_000, 0, 15_250_000, 11_000_000];
        let est = LatencyEstimator::new(0.1);

        let mut expected = 0.0f64;
        for s in samples {
            expected = expected * 0.9 + s as f64 * 0.1 / 2.0;
            est.update(s);
        }

        assert!((est.average() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_constant_samples_converge_to_half() {
        let est = LatencyEstimator::new(0.1);
        let sample = 20_000_000u64;
        let n = 25;
        for _ in 0..n {
            est.update(sample);
        }

        let closed_form = sample as f64 / 2.0 * (1.0 - 0.9f64.powi(n));
        assert!((est.average() - closed_form).abs() < 1e-3);
    }

    #[test]
    fn test_wall_clock_is_after_2020() {
        assert!(wall_clock_nanos() > 1_577_836_800_000_000_000);
    }
}
