//! Decoded log-event model and raw-log decoding.
//!
//! Every contract log the pipeline consumes is decoded into a [`LogEvent`]:
//! a kind tag, the emitting contract, the `(block, tx_index, log_index)`
//! ordering key, and a typed payload. The scalar [`LogEvent::version`] is the
//! single number used wherever latest-wins reconciliation needs one.

use alloy::primitives::{Address, B256, I256, U256};
use alloy::rpc::types::Log;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::event_signatures as sig;

/// Errors produced while decoding a raw log.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event signature {0}")]
    UnknownSignature(B256),
    #[error("log is missing indexed topics (have {have}, need {need})")]
    MissingTopics { have: usize, need: usize },
    #[error("log data truncated (have {have} bytes, need {need})")]
    TruncatedData { have: usize, need: usize },
    #[error("scaled-token contract {0} is not bound to any reserve")]
    UnknownToken(Address),
    #[error("log is missing block number or transaction metadata")]
    MissingMetadata,
}

/// Which scaled-token contract emitted a balance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenSide {
    Collateral,
    StableDebt,
    VariableDebt,
}

/// Resolves a scaled-token contract address to its reserve and side.
///
/// Implemented by the configuration projection; the decoder needs it because
/// Mint/Burn/BalanceTransfer logs identify the token, not the reserve.
pub trait TokenResolver: Send + Sync {
    fn resolve_token(&self, token: Address) -> Option<(Address, TokenSide)>;
}

/// Event kinds the pipeline recognizes. Closed set; anything else is a
/// decode error, not a silent skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ReserveInitialized,
    CollateralConfigurationChanged,
    EModeAssetCategoryChanged,
    EModeCategoryAdded,
    AssetSourceUpdated,
    Mint,
    Burn,
    BalanceTransfer,
    ReserveUsedAsCollateralEnabled,
    ReserveUsedAsCollateralDisabled,
    UserEModeSet,
    ReserveDataUpdated,
    NewTransmission,
    AnswerUpdated,
    PriceCapUpdated,
    CapParametersUpdated,
}

impl EventKind {
    /// Stable name used in stream identities and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReserveInitialized => "ReserveInitialized",
            Self::CollateralConfigurationChanged => "CollateralConfigurationChanged",
            Self::EModeAssetCategoryChanged => "EModeAssetCategoryChanged",
            Self::EModeCategoryAdded => "EModeCategoryAdded",
            Self::AssetSourceUpdated => "AssetSourceUpdated",
            Self::Mint => "Mint",
            Self::Burn => "Burn",
            Self::BalanceTransfer => "BalanceTransfer",
            Self::ReserveUsedAsCollateralEnabled => "ReserveUsedAsCollateralEnabled",
            Self::ReserveUsedAsCollateralDisabled => "ReserveUsedAsCollateralDisabled",
            Self::UserEModeSet => "UserEModeSet",
            Self::ReserveDataUpdated => "ReserveDataUpdated",
            Self::NewTransmission => "NewTransmission",
            Self::AnswerUpdated => "AnswerUpdated",
            Self::PriceCapUpdated => "PriceCapUpdated",
            Self::CapParametersUpdated => "CapParametersUpdated",
        }
    }

    /// Topic-0 hash for this kind.
    pub fn signature(&self) -> B256 {
        match self {
            Self::ReserveInitialized => sig::RESERVE_INITIALIZED,
            Self::CollateralConfigurationChanged => sig::COLLATERAL_CONFIGURATION_CHANGED,
            Self::EModeAssetCategoryChanged => sig::EMODE_ASSET_CATEGORY_CHANGED,
            Self::EModeCategoryAdded => sig::EMODE_CATEGORY_ADDED,
            Self::AssetSourceUpdated => sig::ASSET_SOURCE_UPDATED,
            Self::Mint => sig::MINT,
            Self::Burn => sig::BURN,
            Self::BalanceTransfer => sig::BALANCE_TRANSFER,
            Self::ReserveUsedAsCollateralEnabled => sig::COLLATERAL_ENABLED,
            Self::ReserveUsedAsCollateralDisabled => sig::COLLATERAL_DISABLED,
            Self::UserEModeSet => sig::USER_EMODE_SET,
            Self::ReserveDataUpdated => sig::RESERVE_DATA_UPDATED,
            Self::NewTransmission => sig::NEW_TRANSMISSION,
            Self::AnswerUpdated => sig::ANSWER_UPDATED,
            Self::PriceCapUpdated => sig::PRICE_CAP_UPDATED,
            Self::CapParametersUpdated => sig::CAP_PARAMETERS_UPDATED,
        }
    }

    /// Map a topic-0 hash back to a kind.
    pub fn from_signature(topic0: B256) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.signature() == topic0)
    }
}

/// Every kind, in declaration order.
pub const ALL_KINDS: [EventKind; 16] = [
    EventKind::ReserveInitialized,
    EventKind::CollateralConfigurationChanged,
    EventKind::EModeAssetCategoryChanged,
    EventKind::EModeCategoryAdded,
    EventKind::AssetSourceUpdated,
    EventKind::Mint,
    EventKind::Burn,
    EventKind::BalanceTransfer,
    EventKind::ReserveUsedAsCollateralEnabled,
    EventKind::ReserveUsedAsCollateralDisabled,
    EventKind::UserEModeSet,
    EventKind::ReserveDataUpdated,
    EventKind::NewTransmission,
    EventKind::AnswerUpdated,
    EventKind::PriceCapUpdated,
    EventKind::CapParametersUpdated,
];

/// Kind-specific decoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    ReserveInitialized {
        asset: Address,
        a_token: Address,
        stable_debt_token: Address,
        variable_debt_token: Address,
        interest_rate_strategy: Address,
    },
    CollateralConfigurationChanged {
        asset: Address,
        ltv: u16,
        liquidation_threshold: u16,
        liquidation_bonus: u16,
    },
    EModeAssetCategoryChanged {
        asset: Address,
        old_category_id: u8,
        new_category_id: u8,
    },
    EModeCategoryAdded {
        category_id: u8,
        ltv: u16,
        liquidation_threshold: u16,
        liquidation_bonus: u16,
        label: String,
    },
    AssetSourceUpdated {
        asset: Address,
        source: Address,
    },
    Mint {
        side: TokenSide,
        asset: Address,
        on_behalf_of: Address,
        value: U256,
        balance_increase: U256,
        index: U256,
    },
    Burn {
        side: TokenSide,
        asset: Address,
        from: Address,
        value: U256,
        balance_increase: U256,
        index: U256,
    },
    BalanceTransfer {
        side: TokenSide,
        asset: Address,
        from: Address,
        to: Address,
        value: U256,
        /// Absent on token versions that emit a zero index; the aggregator
        /// falls back to the block-level index recorded for the reserve.
        index: Option<U256>,
    },
    CollateralToggle {
        asset: Address,
        user: Address,
        enabled: bool,
    },
    UserEModeSet {
        user: Address,
        category_id: u8,
    },
    ReserveDataUpdated {
        reserve: Address,
        liquidity_rate: U256,
        stable_borrow_rate: U256,
        variable_borrow_rate: U256,
        liquidity_index: U256,
        variable_borrow_index: U256,
    },
    NewTransmission {
        aggregator_round_id: u32,
        answer: I256,
        transmitter: Address,
    },
    AnswerUpdated {
        current: I256,
        round_id: U256,
        updated_at: u64,
    },
    PriceCapUpdated {
        price_cap: I256,
    },
    CapParametersUpdated {
        snapshot_ratio: U256,
        snapshot_timestamp: u64,
        max_ratio_growth_per_second: U256,
        max_yearly_ratio_growth_percent: u16,
    },
}

/// One decoded, immutable contract log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub kind: EventKind,
    pub contract: Address,
    pub block_number: u64,
    pub tx_index: u32,
    pub log_index: u32,
    pub block_timestamp: u64,
    pub tx_hash: B256,
    pub payload: EventPayload,
}

impl LogEvent {
    /// Total ordering key within a stream.
    pub fn ordering_key(&self) -> (u64, u32, u32) {
        (self.block_number, self.tx_index, self.log_index)
    }

    /// Scalar monotonic version: `block * 10^9 + tx_index * 10^4 + log_index`.
    pub fn version(&self) -> u128 {
        version(self.block_number, self.tx_index, self.log_index)
    }

    /// Re-delivery identity.
    pub fn delivery_key(&self) -> (B256, u32) {
        (self.tx_hash, self.log_index)
    }
}

/// Compose the scalar version from an ordering key.
pub fn version(block_number: u64, tx_index: u32, log_index: u32) -> u128 {
    block_number as u128 * 1_000_000_000 + tx_index as u128 * 10_000 + log_index as u128
}

/// Identity of one totally-ordered event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub chain_id: u64,
    pub kind: EventKind,
    pub contract: Address,
}

impl StreamId {
    pub fn new(chain_id: u64, kind: EventKind, contract: Address) -> Self {
        Self { chain_id, kind, contract }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.chain_id, self.kind.as_str(), self.contract)
    }
}

/// Decode a raw RPC log into a [`LogEvent`].
///
/// `resolver` binds scaled-token addresses to their reserve and side; it is
/// consulted only for Mint/Burn/BalanceTransfer.
pub fn decode_log(log: &Log, resolver: &dyn TokenResolver) -> Result<LogEvent, DecodeError> {
    let topics = log.topics();
    if topics.is_empty() {
        return Err(DecodeError::MissingTopics { have: 0, need: 1 });
    }
    let topic0 = topics[0];
    let kind = EventKind::from_signature(topic0).ok_or(DecodeError::UnknownSignature(topic0))?;

    let contract = log.address();
    let block_number = log.block_number.ok_or(DecodeError::MissingMetadata)?;
    let tx_index = log.transaction_index.ok_or(DecodeError::MissingMetadata)? as u32;
    let log_index = log.log_index.ok_or(DecodeError::MissingMetadata)? as u32;
    let block_timestamp = log.block_timestamp.unwrap_or(0);
    let tx_hash = log.transaction_hash.ok_or(DecodeError::MissingMetadata)?;

    let data = &log.data().data;
    let payload = decode_payload(kind, contract, topics, data, resolver)?;

    Ok(LogEvent {
        kind,
        contract,
        block_number,
        tx_index,
        log_index,
        block_timestamp,
        tx_hash,
        payload,
    })
}

fn decode_payload(
    kind: EventKind,
    contract: Address,
    topics: &[B256],
    data: &[u8],
    resolver: &dyn TokenResolver,
) -> Result<EventPayload, DecodeError> {
    match kind {
        EventKind::ReserveInitialized => {
            need_topics(topics, 3)?;
            Ok(EventPayload::ReserveInitialized {
                asset: topic_addr(topics, 1),
                a_token: topic_addr(topics, 2),
                stable_debt_token: addr_word(data, 0)?,
                variable_debt_token: addr_word(data, 1)?,
                interest_rate_strategy: addr_word(data, 2)?,
            })
        }
        EventKind::CollateralConfigurationChanged => {
            need_topics(topics, 2)?;
            Ok(EventPayload::CollateralConfigurationChanged {
                asset: topic_addr(topics, 1),
                ltv: u256_word(data, 0)?.to::<u16>(),
                liquidation_threshold: u256_word(data, 1)?.to::<u16>(),
                liquidation_bonus: u256_word(data, 2)?.to::<u16>(),
            })
        }
        EventKind::EModeAssetCategoryChanged => {
            need_topics(topics, 2)?;
            Ok(EventPayload::EModeAssetCategoryChanged {
                asset: topic_addr(topics, 1),
                old_category_id: u256_word(data, 0)?.to::<u8>(),
                new_category_id: u256_word(data, 1)?.to::<u8>(),
            })
        }
        EventKind::EModeCategoryAdded => {
            need_topics(topics, 2)?;
            Ok(EventPayload::EModeCategoryAdded {
                category_id: U256::from_be_bytes(topics[1].0).to::<u8>(),
                ltv: u256_word(data, 0)?.to::<u16>(),
                liquidation_threshold: u256_word(data, 1)?.to::<u16>(),
                liquidation_bonus: u256_word(data, 2)?.to::<u16>(),
                label: string_at_offset_word(data, 4).unwrap_or_default(),
            })
        }
        EventKind::AssetSourceUpdated => {
            need_topics(topics, 3)?;
            Ok(EventPayload::AssetSourceUpdated {
                asset: topic_addr(topics, 1),
                source: topic_addr(topics, 2),
            })
        }
        EventKind::Mint => {
            need_topics(topics, 3)?;
            let (asset, side) = resolver
                .resolve_token(contract)
                .ok_or(DecodeError::UnknownToken(contract))?;
            Ok(EventPayload::Mint {
                side,
                asset,
                on_behalf_of: topic_addr(topics, 2),
                value: u256_word(data, 0)?,
                balance_increase: u256_word(data, 1)?,
                index: u256_word(data, 2)?,
            })
        }
        EventKind::Burn => {
            need_topics(topics, 3)?;
            let (asset, side) = resolver
                .resolve_token(contract)
                .ok_or(DecodeError::UnknownToken(contract))?;
            Ok(EventPayload::Burn {
                side,
                asset,
                from: topic_addr(topics, 1),
                value: u256_word(data, 0)?,
                balance_increase: u256_word(data, 1)?,
                index: u256_word(data, 2)?,
            })
        }
        EventKind::BalanceTransfer => {
            need_topics(topics, 3)?;
            let (asset, side) = resolver
                .resolve_token(contract)
                .ok_or(DecodeError::UnknownToken(contract))?;
            let index = u256_word(data, 1)?;
            Ok(EventPayload::BalanceTransfer {
                side,
                asset,
                from: topic_addr(topics, 1),
                to: topic_addr(topics, 2),
                value: u256_word(data, 0)?,
                index: if index.is_zero() { None } else { Some(index) },
            })
        }
        EventKind::ReserveUsedAsCollateralEnabled | EventKind::ReserveUsedAsCollateralDisabled => {
            need_topics(topics, 3)?;
            Ok(EventPayload::CollateralToggle {
                asset: topic_addr(topics, 1),
                user: topic_addr(topics, 2),
                enabled: kind == EventKind::ReserveUsedAsCollateralEnabled,
            })
        }
        EventKind::UserEModeSet => {
            need_topics(topics, 2)?;
            Ok(EventPayload::UserEModeSet {
                user: topic_addr(topics, 1),
                category_id: u256_word(data, 0)?.to::<u8>(),
            })
        }
        EventKind::ReserveDataUpdated => {
            need_topics(topics, 2)?;
            Ok(EventPayload::ReserveDataUpdated {
                reserve: topic_addr(topics, 1),
                liquidity_rate: u256_word(data, 0)?,
                stable_borrow_rate: u256_word(data, 1)?,
                variable_borrow_rate: u256_word(data, 2)?,
                liquidity_index: u256_word(data, 3)?,
                variable_borrow_index: u256_word(data, 4)?,
            })
        }
        EventKind::NewTransmission => {
            need_topics(topics, 2)?;
            Ok(EventPayload::NewTransmission {
                aggregator_round_id: U256::from_be_bytes(topics[1].0).to::<u32>(),
                answer: i256_word(data, 0)?,
                transmitter: addr_word(data, 1)?,
            })
        }
        EventKind::AnswerUpdated => {
            need_topics(topics, 3)?;
            Ok(EventPayload::AnswerUpdated {
                current: I256::from_be_bytes(topics[1].0),
                round_id: U256::from_be_bytes(topics[2].0),
                updated_at: u256_word(data, 0)?.to::<u64>(),
            })
        }
        EventKind::PriceCapUpdated => Ok(EventPayload::PriceCapUpdated {
            price_cap: i256_word(data, 0)?,
        }),
        EventKind::CapParametersUpdated => Ok(EventPayload::CapParametersUpdated {
            snapshot_ratio: u256_word(data, 0)?,
            snapshot_timestamp: u256_word(data, 1)?.to::<u64>(),
            max_ratio_growth_per_second: u256_word(data, 2)?,
            max_yearly_ratio_growth_percent: u256_word(data, 3)?.to::<u16>(),
        }),
    }
}

// ABI word helpers. Data is a sequence of 32-byte words; indexed addresses
// sit in the low 20 bytes of their topic.

fn need_topics(topics: &[B256], need: usize) -> Result<(), DecodeError> {
    if topics.len() < need {
        return Err(DecodeError::MissingTopics { have: topics.len(), need });
    }
    Ok(())
}

fn topic_addr(topics: &[B256], i: usize) -> Address {
    Address::from_slice(&topics[i][12..])
}

fn word(data: &[u8], i: usize) -> Result<&[u8], DecodeError> {
    let start = i * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(DecodeError::TruncatedData { have: data.len(), need: end });
    }
    Ok(&data[start..end])
}

fn u256_word(data: &[u8], i: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_be_slice(word(data, i)?))
}

fn i256_word(data: &[u8], i: usize) -> Result<I256, DecodeError> {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(word(data, i)?);
    Ok(I256::from_be_bytes(bytes))
}

fn addr_word(data: &[u8], i: usize) -> Result<Address, DecodeError> {
    Ok(Address::from_slice(&word(data, i)?[12..]))
}

/// Read a dynamic `string` whose offset pointer sits in word `i`.
fn string_at_offset_word(data: &[u8], i: usize) -> Option<String> {
    let offset = u256_word(data, i).ok()?.to::<usize>();
    if data.len() < offset + 32 {
        return None;
    }
    let len = U256::from_be_slice(&data[offset..offset + 32]).to::<usize>();
    let start = offset + 32;
    if data.len() < start + len {
        return None;
    }
    String::from_utf8(data[start..start + len].to_vec()).ok()
}
