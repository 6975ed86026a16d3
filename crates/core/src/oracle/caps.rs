//! Max-cap adapter state.
//!
//! Two source shapes feed the max-cap stream: stable caps arrive as a final
//! price directly (`PriceCapUpdated`), dynamic caps arrive as snapshot
//! parameters (`CapParametersUpdated`) and are evaluated at query time as
//! the minimum of a linear and an annualized growth bound. The annual bound
//! uses the linear-in-elapsed approximation, not compounding.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use super::types::CapType;
use crate::error::MathError;
use crate::ray_math::{self, BPS_DENOMINATOR, SECONDS_PER_YEAR};

/// Parameters of a dynamic (growth-bounded) price cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicCapParameters {
    pub snapshot_ratio: U256,
    pub snapshot_timestamp: u64,
    pub max_ratio_growth_per_second: U256,
    /// Basis points per year
    pub max_yearly_ratio_growth_percent: u16,
    pub version: u128,
}

impl DynamicCapParameters {
    /// Evaluate the cap at `now`:
    ///
    /// ```text
    /// linear = snapshot_ratio + growth_per_second * elapsed
    /// annual = snapshot_ratio * (1 + pct * elapsed / (10_000 * SECONDS_PER_YEAR))
    /// cap    = min(linear, annual)
    /// ```
    pub fn cap_at(&self, now: u64) -> Result<U256, MathError> {
        let elapsed = now.saturating_sub(self.snapshot_timestamp);
        let elapsed_u = U256::from(elapsed);

        let linear = self
            .snapshot_ratio
            .checked_add(
                self.max_ratio_growth_per_second
                    .checked_mul(elapsed_u)
                    .ok_or(MathError::Overflow)?,
            )
            .ok_or(MathError::Overflow)?;

        let pct_elapsed = U256::from(self.max_yearly_ratio_growth_percent) * elapsed_u;
        let annual_denominator = BPS_DENOMINATOR * U256::from(SECONDS_PER_YEAR);
        let annual_increment =
            ray_math::mul_div_floor(self.snapshot_ratio, pct_elapsed, annual_denominator)?;
        let annual = self
            .snapshot_ratio
            .checked_add(annual_increment)
            .ok_or(MathError::Overflow)?;

        Ok(linear.min(annual))
    }
}

/// Current cap state for one asset source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapState {
    /// `PriceCapUpdated`: the cap is the final price.
    Stable { cap: U256, version: u128 },
    /// `CapParametersUpdated`: the cap bounds the growth multiplier.
    Dynamic(DynamicCapParameters),
}

impl CapState {
    pub fn version(&self) -> u128 {
        match self {
            Self::Stable { version, .. } => *version,
            Self::Dynamic(params) => params.version,
        }
    }

    pub fn cap_type(&self) -> CapType {
        match self {
            Self::Stable { .. } => CapType::PriceCap,
            Self::Dynamic(_) => CapType::RatioCap,
        }
    }

    /// The cap value at `now`.
    pub fn cap_at(&self, now: u64) -> Result<U256, MathError> {
        match self {
            Self::Stable { cap, .. } => Ok(*cap),
            Self::Dynamic(params) => params.cap_at(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray_math::RAY;

    #[test]
    fn test_linear_bound_wins_when_smaller() {
        // growth 1e17/s over one hour adds 3.6e20, far below the annual
        // allowance of ~1.14e22.
        let params = DynamicCapParameters {
            snapshot_ratio: RAY,
            snapshot_timestamp: 1_700_000_000,
            max_ratio_growth_per_second: U256::from(10u64).pow(U256::from(17u64)),
            max_yearly_ratio_growth_percent: 1000,
            version: 1,
        };

        let cap = params.cap_at(1_700_000_000 + 3600).unwrap();
        let linear = RAY + U256::from(3600u64) * U256::from(10u64).pow(U256::from(17u64));
        assert_eq!(cap, linear);
    }

    #[test]
    fn test_annual_bound_wins_when_smaller() {
        // A generous per-second allowance defers to the annual bound:
        // annual = 1e27 * (1 + 1000*3600 / (10_000 * 31_536_000))
        let params = DynamicCapParameters {
            snapshot_ratio: RAY,
            snapshot_timestamp: 1_700_000_000,
            max_ratio_growth_per_second: U256::from(10u64).pow(U256::from(22u64)),
            max_yearly_ratio_growth_percent: 1000,
            version: 1,
        };

        let cap = params.cap_at(1_700_000_000 + 3600).unwrap();
        let expected_annual = RAY
            + ray_math::mul_div_floor(
                RAY,
                U256::from(1000u64 * 3600),
                BPS_DENOMINATOR * U256::from(SECONDS_PER_YEAR),
            )
            .unwrap();
        assert_eq!(cap, expected_annual);
        assert!(cap < RAY + U256::from(3600u64) * U256::from(10u64).pow(U256::from(22u64)));
    }

    #[test]
    fn test_clock_behind_snapshot_saturates() {
        let params = DynamicCapParameters {
            snapshot_ratio: RAY,
            snapshot_timestamp: 1_700_000_000,
            max_ratio_growth_per_second: U256::from(10u64).pow(U256::from(17u64)),
            max_yearly_ratio_growth_percent: 1000,
            version: 1,
        };
        // Elapsed saturates to zero: the cap is exactly the snapshot ratio.
        assert_eq!(params.cap_at(1_600_000_000).unwrap(), RAY);
    }

    #[test]
    fn test_cap_state_dispatch() {
        let stable = CapState::Stable { cap: U256::from(42u64), version: 9 };
        assert_eq!(stable.cap_type(), CapType::PriceCap);
        assert_eq!(stable.cap_at(123).unwrap(), U256::from(42u64));
        assert_eq!(stable.version(), 9);

        let dynamic = CapState::Dynamic(DynamicCapParameters {
            snapshot_ratio: RAY,
            snapshot_timestamp: 0,
            max_ratio_growth_per_second: U256::ZERO,
            max_yearly_ratio_growth_percent: 0,
            version: 3,
        });
        assert_eq!(dynamic.cap_type(), CapType::RatioCap);
        assert_eq!(dynamic.cap_at(1000).unwrap(), RAY);
    }
}
