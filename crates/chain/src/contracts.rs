//! Contract interfaces for the monitored protocol.
//!
//! `sol!`-generated bindings cover the three contract families the pipeline
//! listens to (pool + configurator, scaled tokens, oracle transmission and
//! cap adapters) plus the view functions the multiplier adapters call.
//! Topic-0 constants are the generated `SIGNATURE_HASH`es so the filter set
//! can never drift from the decoder.

use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    /// Pool configurator events that shape the per-asset configuration view.
    interface IPoolConfigurator {
        event ReserveInitialized(
            address indexed asset,
            address indexed aToken,
            address stableDebtToken,
            address variableDebtToken,
            address interestRateStrategyAddress
        );
        event CollateralConfigurationChanged(
            address indexed asset,
            uint256 ltv,
            uint256 liquidationThreshold,
            uint256 liquidationBonus
        );
        event EModeAssetCategoryChanged(address indexed asset, uint8 oldCategoryId, uint8 newCategoryId);
        event EModeCategoryAdded(
            uint8 indexed categoryId,
            uint256 ltv,
            uint256 liquidationThreshold,
            uint256 liquidationBonus,
            address oracle,
            string label
        );
    }

    /// Pool events carrying per-reserve state and per-user flags.
    interface IPool {
        event ReserveDataUpdated(
            address indexed reserve,
            uint256 liquidityRate,
            uint256 stableBorrowRate,
            uint256 variableBorrowRate,
            uint256 liquidityIndex,
            uint256 variableBorrowIndex
        );
        event ReserveUsedAsCollateralEnabled(address indexed reserve, address indexed user);
        event ReserveUsedAsCollateralDisabled(address indexed reserve, address indexed user);
        event UserEModeSet(address indexed user, uint8 categoryId);
    }

    /// Scaled-balance token events (aToken and variable-debt token share the ABI).
    interface IScaledToken {
        event Mint(
            address indexed caller,
            address indexed onBehalfOf,
            uint256 value,
            uint256 balanceIncrease,
            uint256 index
        );
        event Burn(
            address indexed from,
            address indexed target,
            uint256 value,
            uint256 balanceIncrease,
            uint256 index
        );
        event BalanceTransfer(address indexed from, address indexed to, uint256 value, uint256 index);
    }

    /// Protocol oracle registry.
    interface IAaveOracle {
        event AssetSourceUpdated(address indexed asset, address indexed source);
    }

    /// Chainlink-style transmission and aggregator events.
    interface IOffchainAggregator {
        event NewTransmission(
            uint32 indexed aggregatorRoundId,
            int192 answer,
            address transmitter,
            int192[] observations,
            bytes observers,
            bytes32 rawReportContext
        );
        event AnswerUpdated(int256 indexed current, uint256 indexed roundId, uint256 updatedAt);
    }

    /// Price-cap adapter events (stable and dynamic shapes).
    interface IPriceCapAdapter {
        event PriceCapUpdated(int256 priceCap);
        event CapParametersUpdated(
            uint256 snapshotRatio,
            uint256 snapshotTimestamp,
            uint256 maxRatioGrowthPerSecond,
            uint16 maxYearlyRatioGrowthPercent
        );
    }

    /// Exchange-rate view exposed by liquid-staking tokens (wstETH, rETH style).
    #[sol(rpc)]
    interface IExchangeRateProvider {
        function getExchangeRate() external view returns (uint256);
    }

    /// Generic ratio view exposed by ratio-provider adapters.
    #[sol(rpc)]
    interface IRatioProvider {
        function ratio() external view returns (uint256);
    }

    /// Minimal Chainlink aggregator read interface.
    #[sol(rpc)]
    interface IChainlinkAggregator {
        function latestAnswer() external view returns (int256);
        function decimals() external view returns (uint8);
    }

    /// ERC-20 metadata reads used when a reserve is initialized.
    #[sol(rpc)]
    interface IERC20Metadata {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }

    /// Composite price source: references the sub-feeds it combines.
    #[sol(rpc)]
    interface ICompositeSource {
        function ASSET_TO_USD_AGGREGATOR() external view returns (address);
        function BASE_TO_USD_AGGREGATOR() external view returns (address);
        function RATIO_PROVIDER() external view returns (address);
    }
}

/// Topic-0 hashes for every event the pipeline subscribes to.
pub mod event_signatures {
    use super::*;

    pub const RESERVE_INITIALIZED: B256 = IPoolConfigurator::ReserveInitialized::SIGNATURE_HASH;
    pub const COLLATERAL_CONFIGURATION_CHANGED: B256 =
        IPoolConfigurator::CollateralConfigurationChanged::SIGNATURE_HASH;
    pub const EMODE_ASSET_CATEGORY_CHANGED: B256 =
        IPoolConfigurator::EModeAssetCategoryChanged::SIGNATURE_HASH;
    pub const EMODE_CATEGORY_ADDED: B256 = IPoolConfigurator::EModeCategoryAdded::SIGNATURE_HASH;

    pub const RESERVE_DATA_UPDATED: B256 = IPool::ReserveDataUpdated::SIGNATURE_HASH;
    pub const COLLATERAL_ENABLED: B256 = IPool::ReserveUsedAsCollateralEnabled::SIGNATURE_HASH;
    pub const COLLATERAL_DISABLED: B256 = IPool::ReserveUsedAsCollateralDisabled::SIGNATURE_HASH;
    pub const USER_EMODE_SET: B256 = IPool::UserEModeSet::SIGNATURE_HASH;

    pub const MINT: B256 = IScaledToken::Mint::SIGNATURE_HASH;
    pub const BURN: B256 = IScaledToken::Burn::SIGNATURE_HASH;
    pub const BALANCE_TRANSFER: B256 = IScaledToken::BalanceTransfer::SIGNATURE_HASH;

    pub const ASSET_SOURCE_UPDATED: B256 = IAaveOracle::AssetSourceUpdated::SIGNATURE_HASH;
    pub const NEW_TRANSMISSION: B256 = IOffchainAggregator::NewTransmission::SIGNATURE_HASH;
    pub const ANSWER_UPDATED: B256 = IOffchainAggregator::AnswerUpdated::SIGNATURE_HASH;

    pub const PRICE_CAP_UPDATED: B256 = IPriceCapAdapter::PriceCapUpdated::SIGNATURE_HASH;
    pub const CAP_PARAMETERS_UPDATED: B256 = IPriceCapAdapter::CapParametersUpdated::SIGNATURE_HASH;

    /// All configuration-shaping signatures (pool + configurator + oracle registry).
    pub fn configuration_signatures() -> Vec<B256> {
        vec![
            RESERVE_INITIALIZED,
            COLLATERAL_CONFIGURATION_CHANGED,
            EMODE_ASSET_CATEGORY_CHANGED,
            EMODE_CATEGORY_ADDED,
            USER_EMODE_SET,
            ASSET_SOURCE_UPDATED,
        ]
    }

    /// All balance-shaping signatures (scaled tokens + reserve data).
    pub fn balance_signatures() -> Vec<B256> {
        vec![
            MINT,
            BURN,
            BALANCE_TRANSFER,
            COLLATERAL_ENABLED,
            COLLATERAL_DISABLED,
            RESERVE_DATA_UPDATED,
        ]
    }

    /// All price-shaping signatures (transmissions + cap adapters).
    pub fn price_signatures() -> Vec<B256> {
        vec![NEW_TRANSMISSION, ANSWER_UPDATED, PRICE_CAP_UPDATED, CAP_PARAMETERS_UPDATED]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_distinct() {
        let mut sigs = event_signatures::configuration_signatures();
        sigs.extend(event_signatures::balance_signatures());
        sigs.extend(event_signatures::price_signatures());

        let count = sigs.len();
        sigs.sort();
        sigs.dedup();
        assert_eq!(sigs.len(), count);
    }

    #[test]
    fn test_answer_updated_matches_chainlink() {
        // keccak256("AnswerUpdated(int256,uint256,uint256)")
        let expected = "0559884fd3a460db3073b7fc896cc77986f16e378210ded43186175bf646fc5f";
        assert_eq!(hex::encode(event_signatures::ANSWER_UPDATED), expected);
    }
}
