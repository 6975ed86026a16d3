//! Liquidation candidate selection.
//!
//! Scans derived health positions for users in the admission band,
//! enumerates their (collateral, debt) pairs, prices each pair under the
//! liquidation-bonus model and keeps the most profitable candidate per
//! (user, debt asset). Candidates carry the flash-loan sizing and the two
//! swap routes an executor needs; they live in a memory table recomputed on
//! every tick and are never broadcast from here.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sentinel_api::{SwapPath, SwapRouteTable};

use crate::config::config;
use crate::health::{HealthEvaluator, HealthPosition};
use crate::ray_math;

/// One executable liquidation opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationCandidate {
    pub user: Address,
    pub collateral_asset: Address,
    pub debt_asset: Address,
    /// Flash-loan size: close-factor share of the accrued debt
    pub debt_to_cover: U256,
    pub expected_profit_usd: f64,
    /// Basis points, e-mode aware
    pub liquidation_bonus: u16,
    pub health_factor: f64,
    pub collateral_balance_accrued: U256,
    pub debt_balance_accrued: U256,
    /// Exact-output route repaying the flash loan; `None` when
    /// collateral == debt
    pub path_collateral_to_debt: Option<SwapPath>,
    /// Exact-input route converting residual profit
    pub path_collateral_to_weth: Option<SwapPath>,
}

/// Selects and ranks liquidation candidates.
pub struct CandidateEngine {
    evaluator: Arc<HealthEvaluator>,
    routes: Arc<SwapRouteTable>,
    /// (user, debt asset) → top-ranked candidate, rebuilt each tick
    table: DashMap<(Address, Address), LiquidationCandidate>,
}

impl CandidateEngine {
    pub fn new(evaluator: Arc<HealthEvaluator>, routes: Arc<SwapRouteTable>) -> Self {
        Self {
            evaluator,
            routes,
            table: DashMap::new(),
        }
    }

    /// Recompute the candidate table from the latest positions. Returns the
    /// candidates emitted this tick, ranked for submission.
    pub fn tick(&self) -> Vec<LiquidationCandidate> {
        let cfg = config();
        let admitted = self.evaluator.scan(|position| {
            cfg.candidate_health_band.admits(position.health_factor)
                && position.effective_collateral_usd > cfg.candidate_min_usd
                && position.effective_debt_usd > cfg.candidate_min_usd
        });

        self.table.clear();
        let mut emitted = Vec::new();
        for position in &admitted {
            emitted.extend(self.candidates_for(position));
        }

        for candidate in &emitted {
            self.table
                .insert((candidate.user, candidate.debt_asset), candidate.clone());
        }

        if !emitted.is_empty() {
            info!(
                admitted = admitted.len(),
                candidates = emitted.len(),
                "Candidate tick complete"
            );
        }

        rank_for_submission(emitted, &cfg.priority_debt_assets)
    }

    /// Current table contents, ranked for submission.
    pub fn candidates(&self) -> Vec<LiquidationCandidate> {
        let all = self.table.iter().map(|e| e.value().clone()).collect();
        rank_for_submission(all, &config().priority_debt_assets)
    }

    /// The retained candidate for (user, debt asset), if any.
    pub fn get(&self, user: Address, debt_asset: Address) -> Option<LiquidationCandidate> {
        self.table.get(&(user, debt_asset)).map(|c| c.clone())
    }

    /// Number of retained candidates.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Top-ranked candidate per (user, debt asset) for one position.
    fn candidates_for(&self, position: &HealthPosition) -> Vec<LiquidationCandidate> {
        let cfg = config();
        let close_factor_bps = (cfg.close_factor * 10_000.0) as u16;

        let collateral_rows: Vec<_> = position
            .rows
            .iter()
            .filter(|row| row.collateral_enabled && !row.accrued_collateral.is_zero())
            .collect();
        let debt_rows: Vec<_> = position
            .rows
            .iter()
            .filter(|row| !row.accrued_debt.is_zero())
            .collect();

        let mut selected = Vec::new();
        for debt_row in &debt_rows {
            let mut pair_candidates: Vec<LiquidationCandidate> = Vec::new();

            for collateral_row in &collateral_rows {
                let decimals = ray_math::u256_to_f64(collateral_row.decimals_places);
                let bonus = collateral_row.liquidation_bonus;
                let profit_usd = (bonus as f64 / 10_000.0 - 1.0)
                    * ray_math::u256_to_f64(collateral_row.accrued_collateral)
                    * collateral_row.price_usd
                    / decimals;

                let debt_to_cover =
                    match ray_math::mul_bps(debt_row.accrued_debt, close_factor_bps) {
                        Ok(amount) => amount,
                        Err(e) => {
                            debug!(user = %position.user, error = %e, "Skipping pair");
                            continue;
                        }
                    };

                pair_candidates.push(LiquidationCandidate {
                    user: position.user,
                    collateral_asset: collateral_row.asset,
                    debt_asset: debt_row.asset,
                    debt_to_cover,
                    expected_profit_usd: profit_usd,
                    liquidation_bonus: bonus,
                    health_factor: position.health_factor,
                    collateral_balance_accrued: collateral_row.accrued_collateral,
                    debt_balance_accrued: debt_row.accrued_debt,
                    path_collateral_to_debt: None,
                    path_collateral_to_weth: None,
                });
            }

            // Priority collateral first (stable), then profit descending
            // (stable), so the priority order breaks profit ties.
            let priority = &cfg.priority_collateral_assets;
            pair_candidates.sort_by_key(|c| {
                priority
                    .iter()
                    .position(|a| *a == c.collateral_asset)
                    .unwrap_or(priority.len())
            });
            pair_candidates.sort_by(|a, b| {
                b.expected_profit_usd
                    .partial_cmp(&a.expected_profit_usd)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for mut candidate in pair_candidates {
                if candidate.expected_profit_usd <= 0.0 {
                    break;
                }
                if self.resolve_paths(&mut candidate) {
                    selected.push(candidate);
                    break;
                }
                // Paths missing: try the next-ranked pair for this debt.
            }
        }

        selected
    }

    /// Attach swap routes. A candidate survives a missing route only when
    /// collateral and debt are the same token (no repayment swap needed).
    fn resolve_paths(&self, candidate: &mut LiquidationCandidate) -> bool {
        let weth = self.routes.weth();

        if candidate.collateral_asset != candidate.debt_asset {
            match self
                .routes
                .lookup(candidate.collateral_asset, candidate.debt_asset)
            {
                Some(path) => candidate.path_collateral_to_debt = Some(path),
                None => return false,
            }
        }

        if candidate.collateral_asset != weth {
            match self.routes.lookup(candidate.collateral_asset, weth) {
                Some(path) => candidate.path_collateral_to_weth = Some(path),
                None => return candidate.collateral_asset == candidate.debt_asset,
            }
        }

        true
    }
}

/// Submission order: priority debt assets first, then profit descending.
fn rank_for_submission(
    mut candidates: Vec<LiquidationCandidate>,
    priority_debt: &[Address],
) -> Vec<LiquidationCandidate> {
    candidates.sort_by(|a, b| {
        b.expected_profit_usd
            .partial_cmp(&a.expected_profit_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.sort_by_key(|c| {
        priority_debt
            .iter()
            .position(|a| *a == c.debt_asset)
            .unwrap_or(priority_debt.len())
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balances::ScaledBalanceAggregator;
    use crate::health::AssetRow;
    use crate::indices::LiquidityIndexTracker;
    use crate::oracle::PriceComposer;
    use crate::projection::ConfigProjection;
    use std::time::Duration;

    fn user() -> Address {
        Address::repeat_byte(0x11)
    }

    fn weth() -> Address {
        Address::repeat_byte(0xEE)
    }

    fn usdc() -> Address {
        Address::repeat_byte(0xDC)
    }

    fn wad(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    fn engine_with_routes() -> CandidateEngine {
        let indices = Arc::new(LiquidityIndexTracker::new());
        let evaluator = HealthEvaluator::new(
            Arc::new(ScaledBalanceAggregator::new(indices.clone(), false)),
            indices,
            Arc::new(PriceComposer::new(Duration::from_secs(86_400))),
            Arc::new(ConfigProjection::new()),
        );

        let routes = SwapRouteTable::new(weth());
        routes.insert(SwapPath::direct(weth(), usdc(), 500));
        CandidateEngine::new(Arc::new(evaluator), Arc::new(routes))
    }

    fn collateral_row(asset: Address, amount: U256, price: f64, bonus: u16) -> AssetRow {
        AssetRow {
            asset,
            accrued_collateral: amount,
            accrued_debt: U256::ZERO,
            price_usd: price,
            threshold_bps: 8000,
            liquidation_bonus: bonus,
            collateral_enabled: true,
            decimals_places: U256::from(10u64).pow(U256::from(18u64)),
            effective_collateral_usd: 0.0,
            effective_debt_usd: 0.0,
        }
    }

    fn debt_row(asset: Address, amount: U256, price: f64) -> AssetRow {
        AssetRow {
            asset,
            accrued_collateral: U256::ZERO,
            accrued_debt: amount,
            price_usd: price,
            threshold_bps: 0,
            liquidation_bonus: 0,
            collateral_enabled: false,
            decimals_places: U256::from(10u64).pow(U256::from(18u64)),
            effective_collateral_usd: 0.0,
            effective_debt_usd: 0.0,
        }
    }

    fn position(hf: f64, collateral_usd: f64, debt_usd: f64, rows: Vec<AssetRow>) -> HealthPosition {
        HealthPosition {
            user: user(),
            effective_collateral_usd: collateral_usd,
            effective_debt_usd: debt_usd,
            health_factor: hf,
            emode: 0,
            rows: rows.into_iter().collect(),
            block_number: 100,
        }
    }

    #[test]
    fn test_profit_model() {
        // 5% bonus on 5 WETH at $2000: profit = 0.05 * 5 * 2000 = 500
        let engine = engine_with_routes();
        let position = position(
            1.2,
            12_000.0,
            10_000.1,
            vec![
                collateral_row(weth(), wad(5), 2000.0, 10_500),
                debt_row(usdc(), wad(10_000), 1.0),
            ],
        );

        let candidates = engine.candidates_for(&position);
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert!((candidate.expected_profit_usd - 500.0).abs() < 1e-6);
        // 50% close factor on the accrued debt
        assert_eq!(candidate.debt_to_cover, wad(5_000));
        assert_eq!(candidate.health_factor, 1.2);
    }

    #[test]
    fn test_unprofitable_bonus_rejected() {
        // Bonus below par means seizing at a loss.
        let engine = engine_with_routes();
        let position = position(
            1.2,
            12_000.0,
            10_000.1,
            vec![
                collateral_row(weth(), wad(5), 2000.0, 9_500),
                debt_row(usdc(), wad(10_000), 1.0),
            ],
        );
        assert!(engine.candidates_for(&position).is_empty());
    }

    #[test]
    fn test_missing_route_gates_emission() {
        let engine = engine_with_routes();
        // Collateral is USDC: no usdc->weth route was declared, and
        // collateral != debt, so the pair cannot execute.
        let position = position(
            1.2,
            12_000.0,
            10_000.1,
            vec![
                collateral_row(usdc(), wad(12_000), 1.0, 10_500),
                debt_row(weth(), wad(5), 2000.0),
            ],
        );
        assert!(engine.candidates_for(&position).is_empty());
    }

    #[test]
    fn test_same_asset_pair_needs_no_route() {
        let engine = engine_with_routes();
        let position = position(
            1.2,
            12_000.0,
            10_000.1,
            vec![
                AssetRow {
                    accrued_debt: wad(4),
                    effective_debt_usd: 8000.0,
                    ..collateral_row(weth(), wad(6), 2000.0, 10_500)
                },
            ],
        );

        let candidates = engine.candidates_for(&position);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].path_collateral_to_debt.is_none());
        // weth -> weth profit conversion also needs no route
        assert!(candidates[0].path_collateral_to_weth.is_none());
    }

    #[test]
    fn test_top_candidate_per_debt_asset() {
        let wbtc = Address::repeat_byte(0xBC);
        let engine = engine_with_routes();
        // Add a route for the second collateral too.
        engine.routes.insert(SwapPath::direct(wbtc, usdc(), 3000));
        engine.routes.insert(SwapPath::direct(wbtc, weth(), 3000));

        let position = position(
            1.2,
            50_000.0,
            10_000.1,
            vec![
                collateral_row(weth(), wad(5), 2000.0, 10_500),  // profit 500
                collateral_row(wbtc, wad(1), 40_000.0, 10_500),  // profit 2000
                debt_row(usdc(), wad(10_000), 1.0),
            ],
        );

        let candidates = engine.candidates_for(&position);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].collateral_asset, wbtc);
        assert!((candidates[0].expected_profit_usd - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_band_admission() {
        for (hf, collateral, debt, expect) in [
            (1.2, 16_000.0, 15_000.0, true),
            (0.99, 16_000.0, 15_000.0, false), // already liquidatable
            (1.26, 16_000.0, 15_000.0, false), // healthy
            (1.2, 9_000.0, 15_000.0, false),   // dust collateral
        ] {
            let p = position(hf, collateral, debt, Vec::new());
            let admitted = config().candidate_health_band.admits(p.health_factor)
                && p.effective_collateral_usd > config().candidate_min_usd
                && p.effective_debt_usd > config().candidate_min_usd;
            assert_eq!(admitted, expect, "hf={hf}");
        }
    }

    #[test]
    fn test_submission_ranking_respects_priority_debt() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let make = |debt: Address, profit: f64| LiquidationCandidate {
            user: user(),
            collateral_asset: weth(),
            debt_asset: debt,
            debt_to_cover: U256::ZERO,
            expected_profit_usd: profit,
            liquidation_bonus: 10_500,
            health_factor: 1.1,
            collateral_balance_accrued: U256::ZERO,
            debt_balance_accrued: U256::ZERO,
            path_collateral_to_debt: None,
            path_collateral_to_weth: None,
        };

        let ranked = rank_for_submission(vec![make(a, 100.0), make(b, 900.0)], &[a]);
        // Priority debt asset leads despite the lower profit.
        assert_eq!(ranked[0].debt_asset, a);

        let ranked = rank_for_submission(vec![make(a, 100.0), make(b, 900.0)], &[]);
        assert_eq!(ranked[0].debt_asset, b);
    }
}
