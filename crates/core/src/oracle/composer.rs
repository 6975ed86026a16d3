//! Price composition.
//!
//! Reconstructs, per asset source, the price the protocol would read
//! on-chain, plus a predicted price for an imminent transaction:
//!
//! ```text
//! raw       = numerator / denominator * multiplier
//! effective = apply_cap(raw, multiplier, max_cap, cap_type)
//! ```
//!
//! The historical event price reads four event-latest components. The
//! historical transaction price swaps in the transaction-latest numerator
//! only: denominator, multiplier and cap move on rarer configuration
//! transactions, so their pending values are retained but not consulted.
//! The predicted price additionally projects the multiplier one block
//! forward using the measured growth rate.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use sentinel_chain::{EventPayload, LogEvent};

use super::adapters::MultiplierAdapter;
use super::caps::{CapState, DynamicCapParameters};
use super::growth::GrowthEstimator;
use super::streams::{SourceStreams, Variant};
use super::types::{CapType, ComponentKind, ComponentVersions, ComposedPrice, PriceComponent};
use crate::error::OracleError;
use crate::ray_math::{self, RAY};

/// Static wiring of one asset source.
#[derive(Debug, Clone)]
pub struct SourceBinding {
    pub asset: Address,
    pub root_source: Address,
    /// Feed whose transmissions drive the numerator
    pub numerator_feed: Address,
    /// Feed driving the denominator, when the adapter divides two feeds
    pub denominator_feed: Option<Address>,
    /// Cap adapter contract, when the source is capped
    pub cap_feed: Option<Address>,
    pub adapter: MultiplierAdapter,
    /// Decimals of the composed price in feed base units
    pub feed_decimals: u8,
}

struct SourceState {
    binding: SourceBinding,
    streams: SourceStreams,
    cap: RwLock<Option<CapState>>,
    growth: GrowthEstimator,
}

/// Composes asset prices from the four component streams.
pub struct PriceComposer {
    sources: DashMap<Address, Arc<SourceState>>,
    /// feed contract → (root source, component it drives)
    feed_routes: DashMap<Address, (Address, ComponentKind)>,
    /// cap adapter contract → root source
    cap_routes: DashMap<Address, Address>,
    /// asset → root source
    asset_sources: DashMap<Address, Address>,
    growth_window: Duration,
}

impl PriceComposer {
    pub fn new(growth_window: Duration) -> Self {
        Self {
            sources: DashMap::new(),
            feed_routes: DashMap::new(),
            cap_routes: DashMap::new(),
            asset_sources: DashMap::new(),
            growth_window,
        }
    }

    /// Register a source and its feed routing.
    pub fn register_source(&self, binding: SourceBinding) {
        let root = binding.root_source;

        self.feed_routes
            .insert(binding.numerator_feed, (root, ComponentKind::Numerator));
        if let Some(feed) = binding.denominator_feed {
            self.feed_routes.insert(feed, (root, ComponentKind::Denominator));
        }
        if let Some(feed) = binding.cap_feed {
            self.cap_routes.insert(feed, root);
        }
        self.asset_sources.insert(binding.asset, root);

        self.sources.insert(
            root,
            Arc::new(SourceState {
                binding,
                streams: SourceStreams::new(),
                cap: RwLock::new(None),
                growth: GrowthEstimator::new(self.growth_window),
            }),
        );
    }

    /// Root source monitored for an asset.
    pub fn source_for_asset(&self, asset: Address) -> Option<Address> {
        self.asset_sources.get(&asset).map(|s| *s)
    }

    /// The adapter configured for a source.
    pub fn adapter(&self, source: Address) -> Option<MultiplierAdapter> {
        self.sources.get(&source).map(|s| s.binding.adapter.clone())
    }

    /// All registered sources.
    pub fn sources(&self) -> Vec<Address> {
        self.sources.iter().map(|e| *e.key()).collect()
    }

    /// Fold one confirmed on-chain event into the component streams.
    pub fn apply_event(&self, event: &LogEvent) {
        let version = event.version();
        match &event.payload {
            EventPayload::NewTransmission { answer, .. } => {
                if answer.is_negative() {
                    warn!(contract = %event.contract, "Negative transmission answer, skipping");
                    return;
                }
                self.fold_feed_value(
                    event.contract,
                    Variant::Event,
                    answer.unsigned_abs(),
                    version,
                    event.block_number,
                    event.block_timestamp,
                );
            }
            EventPayload::AnswerUpdated { current, updated_at, .. } => {
                if current.is_negative() {
                    warn!(contract = %event.contract, "Negative answer, skipping");
                    return;
                }
                self.fold_feed_value(
                    event.contract,
                    Variant::Event,
                    current.unsigned_abs(),
                    version,
                    event.block_number,
                    *updated_at,
                );
            }
            EventPayload::PriceCapUpdated { price_cap } => {
                let Some(root) = self.cap_routes.get(&event.contract).map(|r| *r) else {
                    return;
                };
                if price_cap.is_negative() {
                    warn!(contract = %event.contract, "Negative price cap, skipping");
                    return;
                }
                self.set_cap(
                    root,
                    CapState::Stable {
                        cap: price_cap.unsigned_abs(),
                        version,
                    },
                );
            }
            EventPayload::CapParametersUpdated {
                snapshot_ratio,
                snapshot_timestamp,
                max_ratio_growth_per_second,
                max_yearly_ratio_growth_percent,
            } => {
                let Some(root) = self.cap_routes.get(&event.contract).map(|r| *r) else {
                    return;
                };
                self.set_cap(
                    root,
                    CapState::Dynamic(DynamicCapParameters {
                        snapshot_ratio: *snapshot_ratio,
                        snapshot_timestamp: *snapshot_timestamp,
                        max_ratio_growth_per_second: *max_ratio_growth_per_second,
                        max_yearly_ratio_growth_percent: *max_yearly_ratio_growth_percent,
                        version,
                    }),
                );
            }
            _ => {}
        }
    }

    /// Fold a pending-transaction value into the transaction-latest streams.
    /// `version` is caller-stamped (pending transactions have no ordering
    /// key yet).
    pub fn apply_pending(&self, feed: Address, value: U256, version: u128, timestamp: u64) {
        self.fold_feed_value(feed, Variant::Transaction, value, version, 0, timestamp);
    }

    /// Record a freshly-fetched multiplier for a source.
    pub fn update_multiplier(
        &self,
        source: Address,
        multiplier: U256,
        version: u128,
        block_number: u64,
        timestamp: u64,
    ) {
        let Some(state) = self.sources.get(&source) else {
            return;
        };
        state.streams.insert_if_version_greater(
            Variant::Event,
            ComponentKind::Multiplier,
            PriceComponent {
                value: multiplier,
                version,
                block_number,
                block_timestamp: timestamp,
            },
        );
        state.growth.record(timestamp, multiplier);
    }

    /// Historical event price: four event-latest components.
    pub fn compose_event(&self, source: Address, now: u64) -> Result<ComposedPrice, OracleError> {
        let state = self.state(source)?;
        let numerator = state
            .streams
            .get(Variant::Event, ComponentKind::Numerator)
            .ok_or(OracleError::MissingComponent("numerator"))?;
        self.compose(&state, numerator, now, None)
    }

    /// Historical transaction price: transaction-latest numerator,
    /// event-latest denominator, multiplier and cap.
    pub fn compose_transaction(
        &self,
        source: Address,
        now: u64,
    ) -> Result<ComposedPrice, OracleError> {
        let state = self.state(source)?;
        let numerator = state
            .streams
            .get_with_fallback(ComponentKind::Numerator)
            .ok_or(OracleError::MissingComponent("numerator"))?;
        self.compose(&state, numerator, now, None)
    }

    /// Predicted transaction price: the transaction composition with the
    /// multiplier projected `seconds_to_next_block` forward.
    pub fn compose_predicted(
        &self,
        source: Address,
        now: u64,
        seconds_to_next_block: f64,
    ) -> Result<ComposedPrice, OracleError> {
        let state = self.state(source)?;
        let numerator = state
            .streams
            .get_with_fallback(ComponentKind::Numerator)
            .ok_or(OracleError::MissingComponent("numerator"))?;

        let multiplier = state
            .streams
            .get(Variant::Event, ComponentKind::Multiplier)
            .map(|c| c.value)
            .unwrap_or(RAY);
        let projected = state.growth.project(multiplier, seconds_to_next_block);

        self.compose(&state, numerator, now, Some(projected))
    }

    fn state(&self, source: Address) -> Result<Arc<SourceState>, OracleError> {
        self.sources
            .get(&source)
            .map(|s| s.clone())
            .ok_or(OracleError::MissingComponent("source"))
    }

    fn fold_feed_value(
        &self,
        feed: Address,
        variant: Variant,
        value: U256,
        version: u128,
        block_number: u64,
        timestamp: u64,
    ) {
        let Some((root, kind)) = self.feed_routes.get(&feed).map(|r| *r) else {
            return;
        };
        let Some(state) = self.sources.get(&root) else {
            return;
        };
        let applied = state.streams.insert_if_version_greater(
            variant,
            kind,
            PriceComponent {
                value,
                version,
                block_number,
                block_timestamp: timestamp,
            },
        );
        if applied {
            debug!(
                source = %root,
                feed = %feed,
                kind = ?kind,
                variant = ?variant,
                value = %value,
                "Folded price component"
            );
        }
    }

    fn set_cap(&self, root: Address, cap: CapState) {
        let Some(state) = self.sources.get(&root) else {
            return;
        };
        let mut slot = state.cap.write();
        match &*slot {
            Some(existing) if existing.version() > cap.version() => {}
            _ => *slot = Some(cap),
        }
    }

    fn compose(
        &self,
        state: &SourceState,
        numerator: PriceComponent,
        now: u64,
        multiplier_override: Option<U256>,
    ) -> Result<ComposedPrice, OracleError> {
        let denominator = state.streams.get(Variant::Event, ComponentKind::Denominator);
        let multiplier_component = state.streams.get(Variant::Event, ComponentKind::Multiplier);

        let denominator_value = denominator.map(|c| c.value).unwrap_or(U256::from(1u64));
        let multiplier_value = multiplier_override
            .or(multiplier_component.map(|c| c.value))
            .unwrap_or(RAY);

        let cap = *state.cap.read();
        let (cap_value, cap_type, cap_version) = match cap {
            Some(cap_state) => (
                Some(cap_state.cap_at(now)?),
                cap_state.cap_type(),
                cap_state.version(),
            ),
            None => (None, CapType::None, 0),
        };

        let effective = match (cap_type, cap_value) {
            (CapType::None, _) | (_, None) => ray_math::mul_div2_floor(
                numerator.value,
                multiplier_value,
                denominator_value,
                RAY,
            )?,
            (CapType::PriceCap, Some(cap_value)) => {
                let raw = ray_math::mul_div2_floor(
                    numerator.value,
                    multiplier_value,
                    denominator_value,
                    RAY,
                )?;
                raw.min(cap_value)
            }
            (CapType::RatioCap, Some(cap_value)) => ray_math::mul_div2_floor(
                numerator.value,
                multiplier_value.min(cap_value),
                denominator_value,
                RAY,
            )?,
        };

        let decimals_places = ray_math::pow10(state.binding.feed_decimals)?;
        let price_usd = ray_math::u256_to_f64(effective) / ray_math::u256_to_f64(decimals_places);

        Ok(ComposedPrice {
            price: effective,
            price_usd,
            block_number: numerator.block_number,
            block_timestamp: numerator.block_timestamp,
            versions: ComponentVersions {
                numerator: numerator.version,
                denominator: denominator.map(|c| c.version).unwrap_or(0),
                multiplier: multiplier_component.map(|c| c.version).unwrap_or(0),
                max_cap: cap_version,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, I256};
    use sentinel_chain::EventKind;

    const NOW: u64 = 1_700_000_000;

    fn source() -> Address {
        Address::repeat_byte(0x50)
    }

    fn feed() -> Address {
        Address::repeat_byte(0x51)
    }

    fn cap_feed() -> Address {
        Address::repeat_byte(0x52)
    }

    fn composer() -> PriceComposer {
        let composer = PriceComposer::new(Duration::from_secs(7 * 86_400));
        composer.register_source(SourceBinding {
            asset: Address::repeat_byte(0xA1),
            root_source: source(),
            numerator_feed: feed(),
            denominator_feed: None,
            cap_feed: Some(cap_feed()),
            adapter: MultiplierAdapter::ConstantOne,
            feed_decimals: 8,
        });
        composer
    }

    fn transmission(contract: Address, answer: i64, block: u64) -> LogEvent {
        LogEvent {
            kind: EventKind::NewTransmission,
            contract,
            block_number: block,
            tx_index: 0,
            log_index: 0,
            block_timestamp: NOW,
            tx_hash: B256::with_last_byte(block as u8),
            payload: EventPayload::NewTransmission {
                aggregator_round_id: block as u32,
                answer: I256::try_from(answer).unwrap(),
                transmitter: Address::ZERO,
            },
        }
    }

    #[test]
    fn test_uncapped_composition() {
        let composer = composer();
        // $2000.00 at 8 feed decimals
        composer.apply_event(&transmission(feed(), 200_000_000_000, 100));

        let price = composer.compose_event(source(), NOW).unwrap();
        assert_eq!(price.price, U256::from(200_000_000_000u64));
        assert!((price.price_usd - 2000.0).abs() < 1e-9);
        assert_eq!(price.versions.numerator, sentinel_chain::version(100, 0, 0));
        assert_eq!(price.versions.multiplier, 0);
    }

    #[test]
    fn test_multiplier_scales_price() {
        let composer = composer();
        composer.apply_event(&transmission(feed(), 200_000_000_000, 100));
        // Multiplier 1.1
        let multiplier = RAY + RAY / U256::from(10u64);
        composer.update_multiplier(source(), multiplier, 5, 100, NOW);

        let price = composer.compose_event(source(), NOW).unwrap();
        assert_eq!(price.price, U256::from(220_000_000_000u64));
    }

    #[test]
    fn test_price_cap_bounds_final_price() {
        let composer = composer();
        composer.apply_event(&transmission(feed(), 200_000_000_000, 100));

        // Stable cap at $1900.00
        let cap_event = LogEvent {
            kind: EventKind::PriceCapUpdated,
            contract: cap_feed(),
            block_number: 101,
            tx_index: 0,
            log_index: 0,
            block_timestamp: NOW,
            tx_hash: B256::with_last_byte(101),
            payload: EventPayload::PriceCapUpdated {
                price_cap: I256::try_from(190_000_000_000i64).unwrap(),
            },
        };
        composer.apply_event(&cap_event);

        let price = composer.compose_event(source(), NOW).unwrap();
        assert_eq!(price.price, U256::from(190_000_000_000u64));
        assert_eq!(price.versions.max_cap, sentinel_chain::version(101, 0, 0));
    }

    #[test]
    fn test_ratio_cap_bounds_multiplier() {
        let composer = composer();
        composer.apply_event(&transmission(feed(), 100_000_000_000, 100));
        // Multiplier 1.2, but the dynamic cap allows only the snapshot ratio 1.1.
        composer.update_multiplier(source(), RAY * U256::from(12u64) / U256::from(10u64), 5, 100, NOW);

        let cap_event = LogEvent {
            kind: EventKind::CapParametersUpdated,
            contract: cap_feed(),
            block_number: 101,
            tx_index: 0,
            log_index: 0,
            block_timestamp: NOW,
            tx_hash: B256::with_last_byte(101),
            payload: EventPayload::CapParametersUpdated {
                snapshot_ratio: RAY * U256::from(11u64) / U256::from(10u64),
                snapshot_timestamp: NOW,
                max_ratio_growth_per_second: U256::ZERO,
                max_yearly_ratio_growth_percent: 0,
            },
        };
        composer.apply_event(&cap_event);

        let price = composer.compose_event(source(), NOW).unwrap();
        // 1000e8 * 1.1 = 1100e8, not 1200e8
        assert_eq!(price.price, U256::from(110_000_000_000u64));
    }

    #[test]
    fn test_transaction_numerator_overrides_event() {
        let composer = composer();
        composer.apply_event(&transmission(feed(), 200_000_000_000, 100));
        composer.apply_pending(
            feed(),
            U256::from(210_000_000_000u64),
            sentinel_chain::version(100, 0, 0) + 1,
            NOW,
        );

        // Event composition ignores the pending value.
        let event_price = composer.compose_event(source(), NOW).unwrap();
        assert_eq!(event_price.price, U256::from(200_000_000_000u64));

        // Transaction composition prefers it.
        let tx_price = composer.compose_transaction(source(), NOW).unwrap();
        assert_eq!(tx_price.price, U256::from(210_000_000_000u64));
    }

    #[test]
    fn test_transaction_falls_back_to_event() {
        let composer = composer();
        composer.apply_event(&transmission(feed(), 200_000_000_000, 100));
        let tx_price = composer.compose_transaction(source(), NOW).unwrap();
        assert_eq!(tx_price.price, U256::from(200_000_000_000u64));
    }

    #[test]
    fn test_predicted_projects_multiplier() {
        let composer = composer();
        composer.apply_event(&transmission(feed(), 100_000_000_000, 100));

        // Multiplier grows 0.001 RAY per second.
        let step = RAY / U256::from(1000u64);
        for i in 0..10u64 {
            composer.update_multiplier(
                source(),
                RAY + step * U256::from(i),
                i as u128 + 1,
                100 + i,
                NOW + i,
            );
        }

        let flat = composer.compose_transaction(source(), NOW + 9).unwrap();
        let predicted = composer.compose_predicted(source(), NOW + 9, 12.0).unwrap();
        assert!(predicted.price > flat.price);
    }

    #[test]
    fn test_missing_numerator() {
        let composer = composer();
        let err = composer.compose_event(source(), NOW).unwrap_err();
        assert!(matches!(err, OracleError::MissingComponent("numerator")));
    }

    #[test]
    fn test_unrouted_feed_ignored() {
        let composer = composer();
        composer.apply_event(&transmission(Address::repeat_byte(0xEE), 1, 100));
        assert!(composer.compose_event(source(), NOW).is_err());
    }
}
