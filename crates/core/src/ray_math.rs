//! Fixed-point arithmetic over 256-bit integers.
//!
//! Indices and growth ratios are RAY-scaled (1e27). Every product that can
//! exceed 256 bits is computed in 512 bits before the final division; a
//! quotient that does not fit back into 256 bits is an [`MathError::Overflow`],
//! never a wrap. All callers get floor rounding unless they explicitly ask
//! for the ceil variants (the debt side of accrual does).

use alloy::primitives::{I256, U256, U512};

use crate::error::MathError;

/// RAY constant: 1e27 for 27-decimal fixed-point arithmetic.
pub const RAY: U256 = U256::from_limbs([0x9fd0803ce8000000, 0x33b2e3c, 0, 0]);

/// Basis points denominator (10000 = 100%).
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000, 0, 0, 0]);

/// Seconds in a (non-leap) year, the protocol's rate denominator.
pub const SECONDS_PER_YEAR: u64 = 31_536_000;

type MathResult<T> = Result<T, MathError>;

/// Widen into the 512-bit working representation.
#[inline(always)]
fn widen(x: U256) -> U512 {
    let mut limbs = [0u64; 8];
    limbs[..4].copy_from_slice(x.as_limbs());
    U512::from_limbs(limbs)
}

/// Narrow back to 256 bits, failing when the high half is populated.
#[inline(always)]
fn narrow(x: U512) -> MathResult<U256> {
    let limbs = x.as_limbs();
    if limbs[4..].iter().any(|&w| w != 0) {
        return Err(MathError::Overflow);
    }
    Ok(U256::from_limbs([limbs[0], limbs[1], limbs[2], limbs[3]]))
}

/// `floor(a * b / denominator)` with a 512-bit intermediate.
pub fn mul_div_floor(a: U256, b: U256, denominator: U256) -> MathResult<U256> {
    if denominator.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    narrow(widen(a) * widen(b) / widen(denominator))
}

/// `ceil(a * b / denominator)` with a 512-bit intermediate.
///
/// The product is at most `(2^256 - 1)^2`, so adding `denominator - 1` never
/// wraps the 512-bit working value.
pub fn mul_div_ceil(a: U256, b: U256, denominator: U256) -> MathResult<U256> {
    if denominator.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    let d = widen(denominator);
    narrow((widen(a) * widen(b) + d - U512::from(1u64)) / d)
}

/// `floor(a * b / (d1 * d2))`: one flooring step for two-factor denominators.
pub fn mul_div2_floor(a: U256, b: U256, d1: U256, d2: U256) -> MathResult<U256> {
    if d1.is_zero() || d2.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    narrow(widen(a) * widen(b) / (widen(d1) * widen(d2)))
}

/// Normalize an underlying amount by a liquidity index:
/// `floor(underlying * RAY / index)`.
pub fn to_scaled(underlying: U256, index: U256) -> MathResult<U256> {
    mul_div_floor(underlying, RAY, index)
}

/// Project a scaled amount forward through a liquidity index:
/// `floor(scaled * index / RAY)`.
pub fn to_underlying(scaled: U256, index: U256) -> MathResult<U256> {
    mul_div_floor(scaled, index, RAY)
}

/// `floor(a * b / RAY)`.
pub fn rmul_floor(a: U256, b: U256) -> MathResult<U256> {
    mul_div_floor(a, b, RAY)
}

/// `ceil(a * b / RAY)`.
pub fn rmul_ceil(a: U256, b: U256) -> MathResult<U256> {
    mul_div_ceil(a, b, RAY)
}

/// `floor(a * RAY / b)`.
pub fn rdiv_floor(a: U256, b: U256) -> MathResult<U256> {
    mul_div_floor(a, RAY, b)
}

/// `floor(value * bps / 10_000)`.
pub fn mul_bps(value: U256, bps: u16) -> MathResult<U256> {
    mul_div_floor(value, U256::from(bps), BPS_DENOMINATOR)
}

/// Signed normalization used for balance deltas: the magnitude is floored,
/// the sign of `amount` is preserved (truncation toward zero).
pub fn to_scaled_signed(amount: I256, index: U256) -> MathResult<I256> {
    let magnitude = to_scaled(amount.unsigned_abs(), index)?;
    let magnitude = I256::try_from(magnitude).map_err(|_| MathError::Overflow)?;
    Ok(if amount.is_negative() { -magnitude } else { magnitude })
}

/// Signed projection through an index; consolidated negatives are the
/// caller's error to surface, not this function's.
pub fn to_underlying_signed(scaled: I256, index: U256) -> MathResult<I256> {
    let magnitude = to_underlying(scaled.unsigned_abs(), index)?;
    let magnitude = I256::try_from(magnitude).map_err(|_| MathError::Overflow)?;
    Ok(if scaled.is_negative() { -magnitude } else { magnitude })
}

/// 10^exp as U256. Fails above 10^77 which no longer fits.
pub fn pow10(exp: u8) -> MathResult<U256> {
    U256::from(10u64)
        .checked_pow(U256::from(exp))
        .ok_or(MathError::Overflow)
}

/// Lossy conversion for ranking and logging only, never for state.
pub fn u256_to_f64(x: U256) -> f64 {
    let limbs = x.as_limbs();
    let mut value = 0.0f64;
    for (i, &limb) in limbs.iter().enumerate() {
        value += limb as f64 * 2f64.powi(64 * i as i32);
    }
    value
}

/// RAY-scaled value as a plain f64 ratio.
pub fn ray_to_f64(x: U256) -> f64 {
    u256_to_f64(x) / 1e27
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ray(n: u64) -> U256 {
        U256::from(n) * RAY
    }

    #[test]
    fn test_ray_constant() {
        assert_eq!(RAY, U256::from(10u64).pow(U256::from(27u64)));
    }

    #[test]
    fn test_to_scaled_and_back() {
        // 1000 tokens at index 1.0
        let underlying = U256::from(1000u64) * U256::from(10u64).pow(U256::from(18u64));
        let scaled = to_scaled(underlying, ray(1)).unwrap();
        assert_eq!(scaled, underlying);

        // Index 1.1 shrinks the scaled amount
        let index = ray(11) / U256::from(10u64);
        let scaled = to_scaled(underlying, index).unwrap();
        assert!(scaled < underlying);
        assert!(to_underlying(scaled, index).unwrap() <= underlying);
    }

    #[test]
    fn test_round_trip_floor_property() {
        // to_underlying(to_scaled(x, idx), idx) <= x, equality when exact
        let idx = ray(2);
        for raw in [1u64, 7, 1_000, 999_999_937] {
            let x = U256::from(raw);
            let round_tripped = to_underlying(to_scaled(x, idx).unwrap(), idx).unwrap();
            assert!(round_tripped <= x);
        }

        // Exactly divisible: equality
        let x = U256::from(1000u64);
        let round_tripped = to_underlying(to_scaled(x, idx).unwrap(), idx).unwrap();
        assert_eq!(round_tripped, x);
    }

    #[test]
    fn test_wide_intermediate_no_spurious_overflow() {
        // a * b overflows 256 bits but the quotient fits.
        let a = U256::MAX / U256::from(2u64);
        let b = ray(1);
        let result = rmul_floor(a, b).unwrap();
        assert_eq!(result, a);
    }

    #[test]
    fn test_overflow_detected() {
        let err = mul_div_floor(U256::MAX, U256::MAX, U256::from(1u64)).unwrap_err();
        assert_eq!(err, MathError::Overflow);
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(rdiv_floor(ray(1), U256::ZERO).unwrap_err(), MathError::DivisionByZero);
        assert_eq!(
            mul_div2_floor(ray(1), ray(1), U256::ZERO, ray(1)).unwrap_err(),
            MathError::DivisionByZero
        );
    }

    #[test]
    fn test_ceil_vs_floor() {
        // 10 / 3 in RAY terms
        let a = U256::from(10u64);
        let b = ray(1) / U256::from(3u64);
        let floor = rmul_floor(a, b).unwrap();
        let ceil = rmul_ceil(a, b).unwrap();
        assert_eq!(ceil, floor + U256::from(1u64));

        // Exact division: identical
        let exact_floor = rmul_floor(U256::from(9u64), ray(1)).unwrap();
        let exact_ceil = rmul_ceil(U256::from(9u64), ray(1)).unwrap();
        assert_eq!(exact_floor, exact_ceil);
    }

    #[test]
    fn test_mul_bps() {
        let value = U256::from(10_000u64);
        assert_eq!(mul_bps(value, 8000).unwrap(), U256::from(8_000u64));
        assert_eq!(mul_bps(value, 10_500).unwrap(), U256::from(10_500u64));
        assert_eq!(mul_bps(value, 0).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_signed_scaling() {
        let index = ray(1);
        let up = to_scaled_signed(I256::try_from(500i64).unwrap(), index).unwrap();
        assert_eq!(up, I256::try_from(500i64).unwrap());

        let down = to_scaled_signed(I256::try_from(-500i64).unwrap(), index).unwrap();
        assert_eq!(down, I256::try_from(-500i64).unwrap());
    }

    #[test]
    fn test_mul_div2_matches_composed() {
        // floor(a*b/(c*d)) with one flooring step
        let a = U256::from(1_000_000u64);
        let b = ray(3);
        let c = U256::from(7u64);
        let result = mul_div2_floor(a, b, c, RAY).unwrap();
        assert_eq!(result, U256::from(3_000_000u64 / 7u64));
    }

    #[test]
    fn test_pow10() {
        assert_eq!(pow10(0).unwrap(), U256::from(1u64));
        assert_eq!(pow10(18).unwrap(), U256::from(10u64).pow(U256::from(18u64)));
        assert_eq!(pow10(77).unwrap(), U256::from(10u64).pow(U256::from(77u64)));
        assert_eq!(pow10(78).unwrap_err(), MathError::Overflow);
    }

    #[test]
    fn test_f64_conversions() {
        assert!((ray_to_f64(ray(1)) - 1.0).abs() < 1e-9);
        assert!((u256_to_f64(U256::from(12345u64)) - 12345.0).abs() < 1e-6);
    }
}
