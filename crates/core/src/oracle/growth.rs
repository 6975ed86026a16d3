//! Multiplier growth estimation.
//!
//! Liquid-staking style multipliers grow slowly and predictably. A
//! least-squares fit over a sliding window of observations yields the
//! per-second growth rate used to project the multiplier one block forward
//! for predicted prices.

use std::collections::VecDeque;
use std::time::Duration;

use alloy::primitives::U256;
use parking_lot::Mutex;

use crate::ray_math;

/// Sliding-window least-squares growth estimator for one source.
pub struct GrowthEstimator {
    /// `(timestamp_secs, multiplier_as_f64)` observations, oldest first
    observations: Mutex<VecDeque<(u64, f64)>>,
    window: Duration,
}

impl GrowthEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
            window,
        }
    }

    /// Record a multiplier observation; observations older than the window
    /// are evicted.
    pub fn record(&self, timestamp: u64, multiplier: U256) {
        let mut observations = self.observations.lock();
        observations.push_back((timestamp, ray_math::u256_to_f64(multiplier)));

        let cutoff = timestamp.saturating_sub(self.window.as_secs());
        while observations.front().is_some_and(|(t, _)| *t < cutoff) {
            observations.pop_front();
        }
    }

    /// Least-squares slope of multiplier per second over the window.
    /// `None` with fewer than two observations or a degenerate time spread.
    pub fn growth_per_sec(&self) -> Option<f64> {
        let observations = self.observations.lock();
        if observations.len() < 2 {
            return None;
        }

        let n = observations.len() as f64;
        let t_mean = observations.iter().map(|(t, _)| *t as f64).sum::<f64>() / n;
        let y_mean = observations.iter().map(|(_, y)| *y).sum::<f64>() / n;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (t, y) in observations.iter() {
            let dt = *t as f64 - t_mean;
            numerator += dt * (*y - y_mean);
            denominator += dt * dt;
        }

        if denominator == 0.0 {
            return None;
        }
        Some(numerator / denominator)
    }

    /// Project a multiplier `seconds_ahead` into the future. Without enough
    /// observations the multiplier is returned unchanged; a negative
    /// projection saturates at zero.
    pub fn project(&self, multiplier: U256, seconds_ahead: f64) -> U256 {
        let Some(slope) = self.growth_per_sec() else {
            return multiplier;
        };

        let projected = ray_math::u256_to_f64(multiplier) + slope * seconds_ahead;
        if projected <= 0.0 {
            return U256::ZERO;
        }
        if projected >= u128::MAX as f64 {
            return multiplier;
        }
        U256::from(projected as u128)
    }

    /// Number of observations currently in the window.
    pub fn len(&self) -> usize {
        self.observations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray_math::RAY;

    fn week() -> Duration {
        Duration::from_secs(7 * 86_400)
    }

    #[test]
    fn test_linear_growth_recovered() {
        let estimator = GrowthEstimator::new(week());
        // Multiplier grows 1e18 ray-units per second.
        for i in 0..10u64 {
            estimator.record(1_700_000_000 + i * 600, RAY + U256::from(i * 600) * U256::from(10u64).pow(U256::from(18u64)));
        }

        let slope = estimator.growth_per_sec().unwrap();
        assert!((slope - 1e18).abs() / 1e18 < 1e-6);
    }

    #[test]
    fn test_projection() {
        let estimator = GrowthEstimator::new(week());
        for i in 0..10u64 {
            estimator.record(1_700_000_000 + i, RAY + U256::from(i) * U256::from(10u64).pow(U256::from(20u64)));
        }

        let current = RAY + U256::from(9u64) * U256::from(10u64).pow(U256::from(20u64));
        let projected = estimator.project(current, 12.0);
        assert!(projected > current);

        // ~12 seconds of 1e20/s growth
        let expected = current + U256::from(12u64) * U256::from(10u64).pow(U256::from(20u64));
        let diff = if projected > expected { projected - expected } else { expected - projected };
        assert!(diff < U256::from(10u64).pow(U256::from(19u64)));
    }

    #[test]
    fn test_no_observations_identity() {
        let estimator = GrowthEstimator::new(week());
        assert_eq!(estimator.project(RAY, 12.0), RAY);

        estimator.record(1_700_000_000, RAY);
        assert!(estimator.growth_per_sec().is_none());
    }

    #[test]
    fn test_window_eviction() {
        let estimator = GrowthEstimator::new(Duration::from_secs(100));
        estimator.record(1_700_000_000, RAY);
        estimator.record(1_700_000_050, RAY);
        assert_eq!(estimator.len(), 2);

        // 200 seconds later, both old points fall out of the window.
        estimator.record(1_700_000_200, RAY);
        assert_eq!(estimator.len(), 1);
    }
}
