//! Multiplier adapters.
//!
//! The multiplier stream is adapter-specific: configuration names one
//! adapter per asset source out of a closed set. Unknown kinds fail the
//! asset's initialization; there is no silent fallback path.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;

use sentinel_chain::ProviderManager;

use crate::error::OracleError;
use crate::ray_math::{self, RAY};

/// Closed set of multiplier adapter kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum MultiplierAdapter {
    /// Multiplier is identically 1 (plain feeds).
    ConstantOne,
    /// wstETH/rETH style: `getExchangeRate()` on the token.
    LiquidStakingRatio { token: Address, rate_decimals: u8 },
    /// Two feeds divided (synchronicity price adapter).
    SynchronicityPrice {
        numerator_feed: Address,
        denominator_feed: Address,
    },
    /// Pendle principal tokens: `exp(-rate * time_to_maturity)`.
    PendleDiscount {
        maturity: u64,
        discount_rate_per_year: f64,
    },
    /// `ratio()` view on a provider contract.
    GenericRatio { provider: Address, rate_decimals: u8 },
}

/// Serde shape of an adapter declaration in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub kind: String,
    #[serde(default)]
    pub token: Option<Address>,
    #[serde(default)]
    pub numerator_feed: Option<Address>,
    #[serde(default)]
    pub denominator_feed: Option<Address>,
    #[serde(default)]
    pub provider: Option<Address>,
    #[serde(default)]
    pub maturity: Option<u64>,
    #[serde(default)]
    pub discount_rate_per_year: Option<f64>,
    /// Decimals of the raw rate read on-chain (default 18)
    #[serde(default = "default_rate_decimals")]
    pub rate_decimals: u8,
}

fn default_rate_decimals() -> u8 {
    18
}

impl MultiplierAdapter {
    /// Resolve a configuration declaration into an adapter. Unknown kinds
    /// and missing parameters are configuration errors.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, OracleError> {
        let missing = |field: &'static str| OracleError::UnknownAdapter(format!(
            "{} requires `{}`",
            config.kind, field
        ));

        match config.kind.as_str() {
            "constant-1" => Ok(Self::ConstantOne),
            "liquid-staking-ratio" => Ok(Self::LiquidStakingRatio {
                token: config.token.ok_or_else(|| missing("token"))?,
                rate_decimals: config.rate_decimals,
            }),
            "synchronicity-price-adapter" => Ok(Self::SynchronicityPrice {
                numerator_feed: config.numerator_feed.ok_or_else(|| missing("numerator_feed"))?,
                denominator_feed: config
                    .denominator_feed
                    .ok_or_else(|| missing("denominator_feed"))?,
            }),
            "pendle-discount" => Ok(Self::PendleDiscount {
                maturity: config.maturity.ok_or_else(|| missing("maturity"))?,
                discount_rate_per_year: config
                    .discount_rate_per_year
                    .ok_or_else(|| missing("discount_rate_per_year"))?,
            }),
            "generic-ratio-provider" => Ok(Self::GenericRatio {
                provider: config.provider.ok_or_else(|| missing("provider"))?,
                rate_decimals: config.rate_decimals,
            }),
            other => Err(OracleError::UnknownAdapter(other.to_string())),
        }
    }

    /// Stable name, mirrors the configuration vocabulary.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ConstantOne => "constant-1",
            Self::LiquidStakingRatio { .. } => "liquid-staking-ratio",
            Self::SynchronicityPrice { .. } => "synchronicity-price-adapter",
            Self::PendleDiscount { .. } => "pendle-discount",
            Self::GenericRatio { .. } => "generic-ratio-provider",
        }
    }

    /// Fetch the current multiplier, RAY-scaled.
    pub async fn fetch(&self, provider: &ProviderManager, now: u64) -> Result<U256> {
        match self {
            Self::ConstantOne => Ok(RAY),
            Self::LiquidStakingRatio { token, rate_decimals } => {
                let rate = provider
                    .exchange_rate(*token)
                    .await
                    .context("reading exchange rate")?;
                scale_to_ray(rate, *rate_decimals)
            }
            Self::SynchronicityPrice {
                numerator_feed,
                denominator_feed,
            } => {
                let (numerator, denominator) = tokio::join!(
                    provider.latest_answer(*numerator_feed),
                    provider.latest_answer(*denominator_feed),
                );
                let numerator = numerator.context("reading numerator feed")?;
                let denominator = denominator.context("reading denominator feed")?;
                if numerator.is_negative() || !denominator.is_positive() {
                    anyhow::bail!("synchronicity feeds returned non-positive answers");
                }
                Ok(ray_math::rdiv_floor(
                    numerator.unsigned_abs(),
                    denominator.unsigned_abs(),
                )?)
            }
            Self::PendleDiscount {
                maturity,
                discount_rate_per_year,
            } => Ok(pendle_discount_multiplier(*maturity, *discount_rate_per_year, now)),
            Self::GenericRatio { provider: addr, rate_decimals } => {
                let rate = provider.ratio(*addr).await.context("reading ratio")?;
                scale_to_ray(rate, *rate_decimals)
            }
        }
    }
}

/// Rescale a rate from `decimals` to RAY (27).
fn scale_to_ray(rate: U256, decimals: u8) -> Result<U256> {
    let scaled = if decimals <= 27 {
        rate.checked_mul(ray_math::pow10(27 - decimals)?)
            .ok_or(crate::error::MathError::Overflow)?
    } else {
        rate / ray_math::pow10(decimals - 27)?
    };
    Ok(scaled)
}

/// `exp(-rate * years_to_maturity)` as a RAY multiplier, clamped to [0, 1].
fn pendle_discount_multiplier(maturity: u64, rate_per_year: f64, now: u64) -> U256 {
    if now >= maturity {
        return RAY;
    }
    let years = (maturity - now) as f64 / ray_math::SECONDS_PER_YEAR as f64;
    let discount = (-rate_per_year * years).exp().clamp(0.0, 1.0);
    U256::from((discount * 1e27) as u128)
}
