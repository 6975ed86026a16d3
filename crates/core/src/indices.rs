//! Per-asset liquidity index and interest rate tracking.
//!
//! Indices only ever grow, so they fold as a max; rates come from the
//! latest `ReserveDataUpdated` by version. A secondary `(asset, block)`
//! table records the highest index seen inside each block, which is what
//! balance transfers without an inline index fall back to.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sentinel_chain::{EventPayload, LogEvent, TokenSide};

/// Latest known index and rate state for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Maximum collateral liquidity index seen
    pub collateral_index: U256,
    /// Maximum variable-debt liquidity index seen
    pub variable_debt_index: U256,
    /// Collateral interest rate from the latest update (ray, per year)
    pub collateral_rate: U256,
    /// Variable-debt interest rate from the latest update (ray, per year)
    pub variable_debt_rate: U256,
    /// Block of the latest rate update
    pub block_number: u64,
    /// Version of the latest rate update
    pub version: u128,
}

impl Default for IndexSnapshot {
    fn default() -> Self {
        Self {
            collateral_index: U256::ZERO,
            variable_debt_index: U256::ZERO,
            collateral_rate: U256::ZERO,
            variable_debt_rate: U256::ZERO,
            block_number: 0,
            version: 0,
        }
    }
}

/// Highest indices observed within one block, per side.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlockIndexes {
    pub collateral: Option<U256>,
    pub variable_debt: Option<U256>,
}

impl BlockIndexes {
    pub fn for_side(&self, side: TokenSide) -> Option<U256> {
        match side {
            TokenSide::Collateral => self.collateral,
            TokenSide::VariableDebt | TokenSide::StableDebt => self.variable_debt,
        }
    }

    fn fold(&mut self, side: TokenSide, index: U256) {
        let slot = match side {
            TokenSide::Collateral => &mut self.collateral,
            TokenSide::VariableDebt | TokenSide::StableDebt => &mut self.variable_debt,
        };
        *slot = Some(slot.map_or(index, |current| current.max(index)));
    }
}

/// Tracks per-asset liquidity indices and interest rates.
pub struct LiquidityIndexTracker {
    latest: DashMap<Address, IndexSnapshot>,
    block_level: DashMap<(Address, u64), BlockIndexes>,
}

impl LiquidityIndexTracker {
    pub fn new() -> Self {
        Self {
            latest: DashMap::new(),
            block_level: DashMap::new(),
        }
    }

    /// Fold a `ReserveDataUpdated` event. Indices max-fold; rates and the
    /// block stamp follow the latest version.
    pub fn apply(&self, event: &LogEvent) {
        let EventPayload::ReserveDataUpdated {
            reserve,
            liquidity_rate,
            variable_borrow_rate,
            liquidity_index,
            variable_borrow_index,
            ..
        } = &event.payload
        else {
            return;
        };

        let version = event.version();
        let mut snapshot = self.latest.entry(*reserve).or_default();

        snapshot.collateral_index = snapshot.collateral_index.max(*liquidity_index);
        snapshot.variable_debt_index = snapshot.variable_debt_index.max(*variable_borrow_index);

        if version >= snapshot.version {
            snapshot.collateral_rate = *liquidity_rate;
            snapshot.variable_debt_rate = *variable_borrow_rate;
            snapshot.block_number = event.block_number;
            snapshot.version = version;
        }
        drop(snapshot);

        let mut block = self.block_level.entry((*reserve, event.block_number)).or_default();
        block.fold(TokenSide::Collateral, *liquidity_index);
        block.fold(TokenSide::VariableDebt, *variable_borrow_index);

        debug!(
            asset = %reserve,
            block = event.block_number,
            collateral_index = %liquidity_index,
            debt_index = %variable_borrow_index,
            "Applied reserve data update"
        );
    }

    /// Record an index observed inline on a Mint/Burn for the block-level
    /// table.
    pub fn record_block_index(&self, asset: Address, block: u64, side: TokenSide, index: U256) {
        self.block_level.entry((asset, block)).or_default().fold(side, index);

        // The inline index also raises the latest max.
        let mut snapshot = self.latest.entry(asset).or_default();
        match side {
            TokenSide::Collateral => {
                snapshot.collateral_index = snapshot.collateral_index.max(index);
            }
            TokenSide::VariableDebt | TokenSide::StableDebt => {
                snapshot.variable_debt_index = snapshot.variable_debt_index.max(index);
            }
        }
    }

    /// Latest snapshot for an asset.
    pub fn get(&self, asset: Address) -> Option<IndexSnapshot> {
        self.latest.get(&asset).map(|s| s.clone())
    }

    /// Block-level indices for `(asset, block)`, if any event recorded one.
    pub fn get_block_level(&self, asset: Address, block: u64) -> Option<BlockIndexes> {
        self.block_level.get(&(asset, block)).map(|b| *b)
    }

    /// Number of assets tracked.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

impl Default for LiquidityIndexTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use sentinel_chain::EventKind;

    use crate::ray_math::RAY;

    fn update(block: u64, tx_index: u32, collateral_index: U256, rate: u64) -> LogEvent {
        LogEvent {
            kind: EventKind::ReserveDataUpdated,
            contract: Address::repeat_byte(0xAA),
            block_number: block,
            tx_index,
            log_index: 0,
            block_timestamp: 0,
            tx_hash: B256::with_last_byte((block % 251) as u8),
            payload: EventPayload::ReserveDataUpdated {
                reserve: Address::repeat_byte(1),
                liquidity_rate: U256::from(rate),
                stable_borrow_rate: U256::ZERO,
                variable_borrow_rate: U256::from(rate),
                liquidity_index: collateral_index,
                variable_borrow_index: collateral_index,
            },
        }
    }

    #[test]
    fn test_indices_monotonic() {
        let tracker = LiquidityIndexTracker::new();
        let asset = Address::repeat_byte(1);

        tracker.apply(&update(100, 0, RAY, 1));
        let higher = RAY + U256::from(5u64);
        tracker.apply(&update(101, 0, higher, 2));
        // A stale, lower index never lowers the fold.
        tracker.apply(&update(102, 0, RAY, 3));

        let snapshot = tracker.get(asset).unwrap();
        assert_eq!(snapshot.collateral_index, higher);
        // Rates still follow the latest version.
        assert_eq!(snapshot.collateral_rate, U256::from(3u64));
        assert_eq!(snapshot.block_number, 102);
    }

    #[test]
    fn test_block_level_max() {
        let tracker = LiquidityIndexTracker::new();
        let asset = Address::repeat_byte(1);

        tracker.record_block_index(asset, 100, TokenSide::Collateral, RAY);
        tracker.record_block_index(asset, 100, TokenSide::Collateral, RAY + U256::from(3u64));
        tracker.record_block_index(asset, 100, TokenSide::Collateral, RAY + U256::from(1u64));

        let block = tracker.get_block_level(asset, 100).unwrap();
        assert_eq!(block.for_side(TokenSide::Collateral), Some(RAY + U256::from(3u64)));
        assert_eq!(block.for_side(TokenSide::VariableDebt), None);
    }

    #[test]
    fn test_inline_index_raises_latest() {
        let tracker = LiquidityIndexTracker::new();
        let asset = Address::repeat_byte(1);

        tracker.record_block_index(asset, 50, TokenSide::VariableDebt, RAY + U256::from(9u64));
        let snapshot = tracker.get(asset).unwrap();
        assert_eq!(snapshot.variable_debt_index, RAY + U256::from(9u64));
    }

    #[test]
    fn test_unknown_asset() {
        let tracker = LiquidityIndexTracker::new();
        assert!(tracker.get(Address::repeat_byte(9)).is_none());
        assert!(tracker.get_block_level(Address::repeat_byte(9), 1).is_none());
    }
}
