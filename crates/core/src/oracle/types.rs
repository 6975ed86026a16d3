//! Price component type definitions.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

/// The four independently-versioned streams that compose a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Numerator,
    Denominator,
    Multiplier,
    MaxCap,
}

/// How the max-cap stream bounds the composed price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CapType {
    /// No cap applied
    #[default]
    None,
    /// Cap denominated as the final price
    PriceCap,
    /// Cap bounds the growth multiplier
    RatioCap,
}

impl CapType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::PriceCap),
            2 => Some(Self::RatioCap),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::PriceCap => 1,
            Self::RatioCap => 2,
        }
    }
}

/// One versioned observation of a price component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceComponent {
    pub value: U256,
    pub version: u128,
    pub block_number: u64,
    pub block_timestamp: u64,
}

/// Versions of the components that fed one composition, attached for
/// downstream consistency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentVersions {
    pub numerator: u128,
    pub denominator: u128,
    pub multiplier: u128,
    pub max_cap: u128,
}

/// A composed asset price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedPrice {
    /// Effective price in feed base units
    pub price: U256,
    /// Effective price in USD (display and ranking)
    pub price_usd: f64,
    /// Block of the numerator observation
    pub block_number: u64,
    /// Timestamp of the numerator observation
    pub block_timestamp: u64,
    /// Contributing component versions
    pub versions: ComponentVersions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_type_round_trip() {
        for value in 0u8..=2 {
            assert_eq!(CapType::from_u8(value).unwrap().as_u8(), value);
        }
        assert_eq!(CapType::from_u8(3), None);
    }
}
