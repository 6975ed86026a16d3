//! Scaled balance aggregation.
//!
//! Folds Mint/Burn/BalanceTransfer and collateral-toggle events into
//! per-(user, asset) scaled balances. Deltas within one (user, asset, side)
//! are associative and commutative, so no cross-stream ordering is needed;
//! idempotence is the event log store's job, this fold applies every event
//! it is handed exactly once.
//!
//! Scaled values are signed: out-of-order application may drive a balance
//! transiently negative, which is legal. A *consolidated* negative is a
//! numeric error the evaluator surfaces per row.

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::{Address, I256, U256};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sentinel_chain::{EventPayload, LogEvent, TokenSide};

use crate::error::BalanceError;
use crate::indices::LiquidityIndexTracker;
use crate::ray_math;

/// Scaled balance state for one (user, asset) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaledBalance {
    /// Sum of applied collateral deltas (scaled units)
    pub collateral_scaled: I256,
    /// Sum of applied variable-debt deltas (scaled units)
    pub variable_debt_scaled: I256,
    /// Sum of applied stable-debt deltas; folded only when configured
    pub stable_debt_scaled: I256,
    /// Highest index any applied collateral event carried
    pub collateral_index: U256,
    /// Highest index any applied debt event carried
    pub debt_index: U256,
    /// Block timestamp of the last applied event
    pub last_updated: u64,
}

impl Default for ScaledBalance {
    fn default() -> Self {
        Self {
            collateral_scaled: I256::ZERO,
            variable_debt_scaled: I256::ZERO,
            stable_debt_scaled: I256::ZERO,
            collateral_index: U256::ZERO,
            debt_index: U256::ZERO,
            last_updated: 0,
        }
    }
}

impl ScaledBalance {
    /// Whether both sides consolidated non-negative.
    pub fn is_consistent(&self) -> bool {
        !self.collateral_scaled.is_negative() && !self.variable_debt_scaled.is_negative()
    }
}

/// Collateral-enabled flag with the version that set it.
#[derive(Debug, Clone, Copy)]
struct VersionedFlag {
    enabled: bool,
    version: u128,
}

/// Folds balance events into per-(user, asset) scaled balances.
pub struct ScaledBalanceAggregator {
    balances: DashMap<(Address, Address), ScaledBalance>,
    collateral_enabled: DashMap<(Address, Address), VersionedFlag>,
    /// Reverse index: user → assets they have touched
    user_assets: DashMap<Address, HashSet<Address>>,
    /// Transfers waiting for a block-level index to become available
    deferred: Mutex<Vec<LogEvent>>,
    indices: Arc<LiquidityIndexTracker>,
    track_stable_debt: bool,
}

impl ScaledBalanceAggregator {
    pub fn new(indices: Arc<LiquidityIndexTracker>, track_stable_debt: bool) -> Self {
        Self {
            balances: DashMap::new(),
            collateral_enabled: DashMap::new(),
            user_assets: DashMap::new(),
            deferred: Mutex::new(Vec::new()),
            indices,
            track_stable_debt,
        }
    }

    /// Fold one event. `IndexUnavailable` means the event was parked on the
    /// deferral queue; call [`Self::retry_deferred`] after new index data.
    pub fn apply(&self, event: &LogEvent) -> Result<(), BalanceError> {
        match &event.payload {
            EventPayload::Mint {
                side,
                asset,
                on_behalf_of,
                value,
                balance_increase,
                index,
            } => {
                // Collateral mints exclude the interest catch-up; debt mints
                // include it.
                let underlying = match side {
                    TokenSide::Collateral => {
                        as_signed(*value)? - as_signed(*balance_increase)?
                    }
                    _ => as_signed(*value)? + as_signed(*balance_increase)?,
                };
                self.apply_delta(*on_behalf_of, *asset, *side, underlying, *index, event)?;
                if *side != TokenSide::StableDebt {
                    self.indices.record_block_index(*asset, event.block_number, *side, *index);
                }
                Ok(())
            }
            EventPayload::Burn {
                side,
                asset,
                from,
                value,
                balance_increase,
                index,
            } => {
                let underlying = -(as_signed(*value)? + as_signed(*balance_increase)?);
                self.apply_delta(*from, *asset, *side, underlying, *index, event)?;
                if *side != TokenSide::StableDebt {
                    self.indices.record_block_index(*asset, event.block_number, *side, *index);
                }
                Ok(())
            }
            EventPayload::BalanceTransfer {
                side,
                asset,
                from,
                to,
                value,
                index,
            } => {
                let index = match index {
                    Some(index) => *index,
                    None => {
                        let block_level = self
                            .indices
                            .get_block_level(*asset, event.block_number)
                            .and_then(|b| b.for_side(*side));
                        match block_level {
                            Some(index) => index,
                            None => {
                                self.deferred.lock().push(event.clone());
                                return Err(BalanceError::IndexUnavailable {
                                    asset: *asset,
                                    block: event.block_number,
                                });
                            }
                        }
                    }
                };

                let moved = as_signed(*value)?;
                self.apply_delta(*from, *asset, *side, -moved, index, event)?;
                self.apply_delta(*to, *asset, *side, moved, index, event)?;
                Ok(())
            }
            EventPayload::CollateralToggle { asset, user, enabled } => {
                self.set_collateral_enabled(*user, *asset, *enabled, event.version());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Re-apply deferred transfers whose block-level index has appeared.
    /// Returns how many were drained.
    pub fn retry_deferred(&self) -> usize {
        let parked: Vec<LogEvent> = std::mem::take(&mut *self.deferred.lock());
        if parked.is_empty() {
            return 0;
        }

        let before = parked.len();
        for event in parked {
            match self.apply(&event) {
                Ok(()) => {}
                Err(BalanceError::IndexUnavailable { .. }) => {
                    // apply() re-parked it
                }
                Err(e) => {
                    warn!(error = %e, "Deferred transfer failed permanently, dropping");
                }
            }
        }
        before - self.deferred.lock().len()
    }

    /// Number of transfers currently parked.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Scaled balance for (user, asset).
    pub fn get(&self, user: Address, asset: Address) -> Option<ScaledBalance> {
        self.balances.get(&(user, asset)).map(|b| b.clone())
    }

    /// Assets a user has ever held or owed.
    pub fn assets_of(&self, user: Address) -> Vec<Address> {
        self.user_assets
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every user currently known.
    pub fn users(&self) -> Vec<Address> {
        self.user_assets.iter().map(|e| *e.key()).collect()
    }

    /// Whether (user, asset) collateral is enabled. Event-sourced; defaults
    /// to false when no toggle was ever seen.
    pub fn is_collateral_enabled(&self, user: Address, asset: Address) -> bool {
        self.collateral_enabled
            .get(&(user, asset))
            .map(|f| f.enabled)
            .unwrap_or(false)
    }

    /// Pairs whose consolidated balance is negative. These are error rows:
    /// excluded downstream, surfaced for the operator.
    pub fn inconsistent_pairs(&self) -> Vec<(Address, Address)> {
        self.balances
            .iter()
            .filter(|e| !e.value().is_consistent())
            .map(|e| *e.key())
            .collect()
    }

    /// Number of (user, asset) pairs tracked.
    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    fn set_collateral_enabled(&self, user: Address, asset: Address, enabled: bool, version: u128) {
        let mut flag = self
            .collateral_enabled
            .entry((user, asset))
            .or_insert(VersionedFlag { enabled, version });
        // Most recent version wins on race.
        if version >= flag.version {
            flag.enabled = enabled;
            flag.version = version;
        }
        self.user_assets.entry(user).or_default().insert(asset);
    }

    fn apply_delta(
        &self,
        user: Address,
        asset: Address,
        side: TokenSide,
        underlying: I256,
        index: U256,
        event: &LogEvent,
    ) -> Result<(), BalanceError> {
        if side == TokenSide::StableDebt && !self.track_stable_debt {
            debug!(user = %user, asset = %asset, "Ignoring stable-debt event");
            return Ok(());
        }

        let scaled = ray_math::to_scaled_signed(underlying, index)?;

        let mut balance = self.balances.entry((user, asset)).or_default();
        match side {
            TokenSide::Collateral => {
                balance.collateral_scaled += scaled;
                balance.collateral_index = balance.collateral_index.max(index);
            }
            TokenSide::VariableDebt => {
                balance.variable_debt_scaled += scaled;
                balance.debt_index = balance.debt_index.max(index);
            }
            TokenSide::StableDebt => {
                balance.stable_debt_scaled += scaled;
            }
        }
        balance.last_updated = balance.last_updated.max(event.block_timestamp);
        drop(balance);

        self.user_assets.entry(user).or_default().insert(asset);

        debug!(
            user = %user,
            asset = %asset,
            side = ?side,
            scaled = %scaled,
            "Applied balance delta"
        );
        Ok(())
    }
}

fn as_signed(value: U256) -> Result<I256, BalanceError> {
    I256::try_from(value).map_err(|_| crate::error::MathError::Overflow.into())
}
