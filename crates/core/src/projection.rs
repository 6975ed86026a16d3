//! Configuration projection.
//!
//! Folds protocol-configuration events into a per-asset view. Every field
//! carries the version of the event that set it and only moves forward
//! (last-writer-wins by version). E-mode parameters are denormalized into
//! each asset's view and recomputed whenever the asset-to-category mapping
//! or the category definition changes.
//!
//! Consumers read an immutable snapshot published by [`ConfigProjection::publish`]
//! and swapped atomically, so a scan never observes a half-applied update.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sentinel_chain::{EventPayload, LogEvent, TokenResolver, TokenSide};

use crate::ray_math;

/// A value stamped with the version of the event that set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u128,
}

impl<T> Versioned<T> {
    fn new(value: T, version: u128) -> Self {
        Self { value, version }
    }
}

/// Overwrite `slot` when `version` is not older than what it holds.
fn set_if_newer<T>(slot: &mut Option<Versioned<T>>, value: T, version: u128) {
    match slot {
        Some(existing) if existing.version > version => {}
        _ => *slot = Some(Versioned::new(value, version)),
    }
}

/// One e-mode category definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EModeCategory {
    pub ltv: u16,
    pub liquidation_threshold: u16,
    pub liquidation_bonus: u16,
    pub label: String,
    pub version: u128,
}

/// Internal per-asset fold state; every field independently versioned.
#[derive(Debug, Clone, Default)]
struct AssetConfigState {
    a_token: Option<Versioned<Address>>,
    stable_debt_token: Option<Versioned<Address>>,
    variable_debt_token: Option<Versioned<Address>>,
    interest_rate_strategy: Option<Versioned<Address>>,
    collateral_ltv: Option<Versioned<u16>>,
    collateral_liquidation_threshold: Option<Versioned<u16>>,
    collateral_liquidation_bonus: Option<Versioned<u16>>,
    emode_category: Option<Versioned<u8>>,
    name: Option<Versioned<String>>,
    symbol: Option<Versioned<String>>,
    decimals: Option<Versioned<u8>>,
    asset_source: Option<Versioned<Address>>,
}

/// Flattened per-asset configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfigView {
    pub asset: Address,
    pub a_token: Option<Address>,
    pub stable_debt_token: Option<Address>,
    pub variable_debt_token: Option<Address>,
    pub interest_rate_strategy: Option<Address>,
    /// Basis points
    pub collateral_ltv: u16,
    pub collateral_liquidation_threshold: u16,
    pub collateral_liquidation_bonus: u16,
    /// 0 = no category
    pub emode_category: u8,
    pub emode_ltv: u16,
    pub emode_liquidation_threshold: u16,
    pub emode_liquidation_bonus: u16,
    pub name: String,
    pub symbol: String,
    pub decimals: Option<u8>,
    /// `10^decimals`
    pub decimals_places: U256,
    pub asset_source: Option<Address>,
    /// Set when the asset is excluded from candidacy
    pub degraded: Option<String>,
}

/// Folds configuration events into per-asset views.
pub struct ConfigProjection {
    assets: DashMap<Address, AssetConfigState>,
    categories: DashMap<u8, EModeCategory>,
    user_emode: DashMap<Address, Versioned<u8>>,
    /// scaled-token contract → (reserve, side)
    token_index: DashMap<Address, (Address, TokenSide)>,
    /// asset → degradation reason
    degraded: DashMap<Address, String>,
    /// Published snapshot, pointer-swapped on publish
    published: RwLock<Arc<HashMap<Address, AssetConfigView>>>,
}

impl ConfigProjection {
    pub fn new() -> Self {
        Self {
            assets: DashMap::new(),
            categories: DashMap::new(),
            user_emode: DashMap::new(),
            token_index: DashMap::new(),
            degraded: DashMap::new(),
            published: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Fold one configuration event.
    pub fn apply(&self, event: &LogEvent) {
        let version = event.version();
        match &event.payload {
            EventPayload::ReserveInitialized {
                asset,
                a_token,
                stable_debt_token,
                variable_debt_token,
                interest_rate_strategy,
            } => {
                let mut state = self.assets.entry(*asset).or_default();
                set_if_newer(&mut state.a_token, *a_token, version);
                set_if_newer(&mut state.stable_debt_token, *stable_debt_token, version);
                set_if_newer(&mut state.variable_debt_token, *variable_debt_token, version);
                set_if_newer(&mut state.interest_rate_strategy, *interest_rate_strategy, version);
                drop(state);

                self.token_index.insert(*a_token, (*asset, TokenSide::Collateral));
                self.token_index.insert(*stable_debt_token, (*asset, TokenSide::StableDebt));
                self.token_index.insert(*variable_debt_token, (*asset, TokenSide::VariableDebt));

                info!(asset = %asset, a_token = %a_token, "Reserve initialized");
            }
            EventPayload::CollateralConfigurationChanged {
                asset,
                ltv,
                liquidation_threshold,
                liquidation_bonus,
            } => {
                if !(ltv <= liquidation_threshold && *liquidation_threshold <= 10_000) {
                    self.mark_degraded(
                        *asset,
                        format!(
                            "invalid collateral configuration: ltv {ltv} > threshold {liquidation_threshold} or threshold > 10000"
                        ),
                    );
                    return;
                }
                let mut state = self.assets.entry(*asset).or_default();
                set_if_newer(&mut state.collateral_ltv, *ltv, version);
                set_if_newer(&mut state.collateral_liquidation_threshold, *liquidation_threshold, version);
                set_if_newer(&mut state.collateral_liquidation_bonus, *liquidation_bonus, version);
            }
            EventPayload::EModeAssetCategoryChanged { asset, new_category_id, .. } => {
                let mut state = self.assets.entry(*asset).or_default();
                set_if_newer(&mut state.emode_category, *new_category_id, version);
            }
            EventPayload::EModeCategoryAdded {
                category_id,
                ltv,
                liquidation_threshold,
                liquidation_bonus,
                label,
            } => {
                let mut entry = self.categories.entry(*category_id).or_insert_with(|| EModeCategory {
                    ltv: 0,
                    liquidation_threshold: 0,
                    liquidation_bonus: 0,
                    label: String::new(),
                    version: 0,
                });
                if version >= entry.version {
                    *entry = EModeCategory {
                        ltv: *ltv,
                        liquidation_threshold: *liquidation_threshold,
                        liquidation_bonus: *liquidation_bonus,
                        label: label.clone(),
                        version,
                    };
                }
            }
            EventPayload::AssetSourceUpdated { asset, source } => {
                let mut state = self.assets.entry(*asset).or_default();
                set_if_newer(&mut state.asset_source, *source, version);
                debug!(asset = %asset, source = %source, "Asset source bound");
            }
            EventPayload::UserEModeSet { user, category_id } => {
                let mut entry = self
                    .user_emode
                    .entry(*user)
                    .or_insert(Versioned::new(*category_id, version));
                if version >= entry.version {
                    *entry = Versioned::new(*category_id, version);
                }
            }
            _ => {}
        }
    }

    /// Record token metadata fetched at reserve initialization.
    pub fn set_token_metadata(
        &self,
        asset: Address,
        name: String,
        symbol: String,
        decimals: u8,
        version: u128,
    ) {
        let mut state = self.assets.entry(asset).or_default();
        set_if_newer(&mut state.name, name, version);
        set_if_newer(&mut state.symbol, symbol, version);
        set_if_newer(&mut state.decimals, decimals, version);
    }

    /// Exclude an asset from candidacy with a reason.
    pub fn mark_degraded(&self, asset: Address, reason: String) {
        warn!(asset = %asset, reason = %reason, "Asset degraded");
        self.degraded.insert(asset, reason);
    }

    /// Operator acknowledgement: clear an asset's degraded flag.
    pub fn acknowledge_asset(&self, asset: Address) -> bool {
        self.degraded.remove(&asset).is_some()
    }

    /// E-mode category for a user (0 = none).
    pub fn user_emode(&self, user: Address) -> u8 {
        self.user_emode.get(&user).map(|v| v.value).unwrap_or(0)
    }

    /// A category definition, if known.
    pub fn category(&self, id: u8) -> Option<EModeCategory> {
        self.categories.get(&id).map(|c| c.clone())
    }

    /// Build and publish a fresh snapshot of all asset views.
    pub fn publish(&self) {
        let mut views = HashMap::with_capacity(self.assets.len());
        for entry in self.assets.iter() {
            views.insert(*entry.key(), self.build_view(*entry.key(), entry.value()));
        }
        *self.published.write() = Arc::new(views);
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> Arc<HashMap<Address, AssetConfigView>> {
        self.published.read().clone()
    }

    /// The live (unpublished) view of a single asset.
    pub fn view(&self, asset: Address) -> Option<AssetConfigView> {
        self.assets.get(&asset).map(|state| self.build_view(asset, state.value()))
    }

    /// Assets currently excluded from candidacy.
    pub fn degraded_assets(&self) -> Vec<(Address, String)> {
        self.degraded.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    /// Number of known assets.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    fn build_view(&self, asset: Address, state: &AssetConfigState) -> AssetConfigView {
        let emode_category = state.emode_category.map(|v| v.value).unwrap_or(0);
        let category = if emode_category != 0 {
            self.categories.get(&emode_category).map(|c| c.clone())
        } else {
            None
        };

        let decimals = state.decimals.map(|v| v.value);
        let decimals_places = decimals
            .and_then(|d| ray_math::pow10(d).ok())
            .unwrap_or(U256::ZERO);

        AssetConfigView {
            asset,
            a_token: state.a_token.map(|v| v.value),
            stable_debt_token: state.stable_debt_token.map(|v| v.value),
            variable_debt_token: state.variable_debt_token.map(|v| v.value),
            interest_rate_strategy: state.interest_rate_strategy.map(|v| v.value),
            collateral_ltv: state.collateral_ltv.map(|v| v.value).unwrap_or(0),
            collateral_liquidation_threshold: state
                .collateral_liquidation_threshold
                .map(|v| v.value)
                .unwrap_or(0),
            collateral_liquidation_bonus: state
                .collateral_liquidation_bonus
                .map(|v| v.value)
                .unwrap_or(0),
            emode_category,
            emode_ltv: category.as_ref().map(|c| c.ltv).unwrap_or(0),
            emode_liquidation_threshold: category
                .as_ref()
                .map(|c| c.liquidation_threshold)
                .unwrap_or(0),
            emode_liquidation_bonus: category.as_ref().map(|c| c.liquidation_bonus).unwrap_or(0),
            name: state.name.clone().map(|v| v.value).unwrap_or_default(),
            symbol: state.symbol.clone().map(|v| v.value).unwrap_or_default(),
            decimals,
            decimals_places,
            asset_source: state.asset_source.map(|v| v.value),
            degraded: self.degraded.get(&asset).map(|r| r.clone()),
        }
    }
}

impl Default for ConfigProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenResolver for ConfigProjection {
    fn resolve_token(&self, token: Address) -> Option<(Address, TokenSide)> {
        self.token_index.get(&token).map(|entry| *entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use sentinel_chain::EventKind;

    fn asset() -> Address {
        Address::repeat_byte(0xA1)
    }

    fn event(kind: EventKind, block: u64, payload: EventPayload) -> LogEvent {
        LogEvent {
            kind,
            contract: Address::repeat_byte(0xCC),
            block_number: block,
            tx_index: 0,
            log_index: 0,
            block_timestamp: 0,
            tx_hash: B256::with_last_byte(block as u8),
            payload,
        }
    }

    fn collateral_config(block: u64, ltv: u16, lt: u16, bonus: u16) -> LogEvent {
        event(
            EventKind::CollateralConfigurationChanged,
            block,
            EventPayload::CollateralConfigurationChanged {
                asset: asset(),
                ltv,
                liquidation_threshold: lt,
                liquidation_bonus: bonus,
            },
        )
    }

    #[test]
    fn test_latest_version_wins_per_field() {
        let projection = ConfigProjection::new();
        projection.apply(&collateral_config(100, 8000, 8500, 10500));
        // Stale update must not regress.
        projection.apply(&collateral_config(50, 7000, 7500, 10200));

        let view = projection.view(asset()).unwrap();
        assert_eq!(view.collateral_ltv, 8000);
        assert_eq!(view.collateral_liquidation_threshold, 8500);
        assert_eq!(view.collateral_liquidation_bonus, 10500);
    }

    #[test]
    fn test_invalid_configuration_degrades() {
        let projection = ConfigProjection::new();
        // ltv above threshold violates the configuration invariant.
        projection.apply(&collateral_config(100, 9000, 8500, 10500));

        assert_eq!(projection.degraded_assets().len(), 1);
        assert!(projection.acknowledge_asset(asset()));
        assert!(projection.degraded_assets().is_empty());
    }

    #[test]
    fn test_emode_denormalization() {
        let projection = ConfigProjection::new();
        projection.apply(&event(
            EventKind::EModeCategoryAdded,
            100,
            EventPayload::EModeCategoryAdded {
                category_id: 1,
                ltv: 9300,
                liquidation_threshold: 9500,
                liquidation_bonus: 10100,
                label: "ETH correlated".into(),
            },
        ));
        projection.apply(&event(
            EventKind::EModeAssetCategoryChanged,
            101,
            EventPayload::EModeAssetCategoryChanged {
                asset: asset(),
                old_category_id: 0,
                new_category_id: 1,
            },
        ));

        let view = projection.view(asset()).unwrap();
        assert_eq!(view.emode_category, 1);
        assert_eq!(view.emode_liquidation_threshold, 9500);

        // Redefining the category flows through to the asset view.
        projection.apply(&event(
            EventKind::EModeCategoryAdded,
            102,
            EventPayload::EModeCategoryAdded {
                category_id: 1,
                ltv: 9000,
                liquidation_threshold: 9200,
                liquidation_bonus: 10150,
                label: "ETH correlated".into(),
            },
        ));
        let view = projection.view(asset()).unwrap();
        assert_eq!(view.emode_liquidation_threshold, 9200);
    }

    #[test]
    fn test_token_resolution() {
        let projection = ConfigProjection::new();
        let a_token = Address::repeat_byte(0x0A);
        let v_token = Address::repeat_byte(0x0B);
        projection.apply(&event(
            EventKind::ReserveInitialized,
            100,
            EventPayload::ReserveInitialized {
                asset: asset(),
                a_token,
                stable_debt_token: Address::repeat_byte(0x0C),
                variable_debt_token: v_token,
                interest_rate_strategy: Address::repeat_byte(0x0D),
            },
        ));

        assert_eq!(projection.resolve_token(a_token), Some((asset(), TokenSide::Collateral)));
        assert_eq!(projection.resolve_token(v_token), Some((asset(), TokenSide::VariableDebt)));
        assert_eq!(projection.resolve_token(Address::repeat_byte(0xFF)), None);
    }

    #[test]
    fn test_user_emode_latest_wins() {
        let projection = ConfigProjection::new();
        let user = Address::repeat_byte(0x11);

        projection.apply(&event(
            EventKind::UserEModeSet,
            100,
            EventPayload::UserEModeSet { user, category_id: 1 },
        ));
        projection.apply(&event(
            EventKind::UserEModeSet,
            90,
            EventPayload::UserEModeSet { user, category_id: 2 },
        ));
        assert_eq!(projection.user_emode(user), 1);
    }

    #[test]
    fn test_snapshot_swap() {
        let projection = ConfigProjection::new();
        projection.apply(&collateral_config(100, 8000, 8500, 10500));

        let before = projection.snapshot();
        assert!(before.is_empty());

        projection.publish();
        let after = projection.snapshot();
        assert_eq!(after.len(), 1);
        // The old snapshot is untouched.
        assert!(before.is_empty());
    }

    #[test]
    fn test_decimals_places() {
        let projection = ConfigProjection::new();
        projection.set_token_metadata(asset(), "USD Coin".into(), "USDC".into(), 6, 1);
        let view = projection.view(asset()).unwrap();
        assert_eq!(view.decimals, Some(6));
        assert_eq!(view.decimals_places, U256::from(1_000_000u64));
    }
}
