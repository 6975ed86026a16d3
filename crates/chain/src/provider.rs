//! Provider management for HTTP connections.
//! Uses Alloy providers for type-safe RPC interactions.

use std::collections::VecDeque;
use std::time::Duration;

use alloy::primitives::{Address, B256, I256, U256, U64};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::contracts::{
    IChainlinkAggregator, ICompositeSource, IERC20Metadata, IExchangeRateProvider, IRatioProvider,
};

/// Errors from chain synchronization that the coordinator classifies.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("rpc request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("chain reorganization deeper than {depth} blocks at block {block}")]
    ReorgTooDeep { block: u64, depth: u64 },
}

/// Token metadata read at reserve initialization.
#[derive(Debug, Clone)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Sub-feeds referenced by a composite price source.
#[derive(Debug, Clone, Default)]
pub struct CompositeSourceRefs {
    pub asset_to_usd: Option<Address>,
    pub base_to_usd: Option<Address>,
    pub ratio_provider: Option<Address>,
}

impl CompositeSourceRefs {
    /// Every referenced sub-source.
    pub fn children(&self) -> Vec<Address> {
        [self.asset_to_usd, self.base_to_usd, self.ratio_provider]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Provider manager for RPC connections.
///
/// Every outbound call goes through [`ProviderManager::with_deadline`], so a
/// hung endpoint surfaces as `SyncError::Timeout` instead of stalling a sync
/// task past its tick.
#[derive(Clone)]
pub struct ProviderManager {
    /// HTTP URL (head-range reads)
    http_url: String,
    /// Archive URL (deep backfill reads)
    archive_url: String,
    /// Per-request deadline
    rpc_timeout: Duration,
}

impl ProviderManager {
    /// Create a new provider manager and verify connectivity.
    pub async fn new(http_url: &str, archive_url: &str, rpc_timeout: Duration) -> Result<Self> {
        info!(http = http_url, archive = archive_url, "Initializing provider manager");

        let manager = Self {
            http_url: http_url.to_string(),
            archive_url: archive_url.to_string(),
            rpc_timeout,
        };

        let block = manager.block_number().await?;
        info!(block = block, "Provider connection verified");

        Ok(manager)
    }

    /// Get the HTTP URL.
    pub fn http_url(&self) -> &str {
        &self.http_url
    }

    /// Get the archive URL.
    pub fn archive_url(&self) -> &str {
        &self.archive_url
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.rpc_timeout).into()),
        }
    }

    /// Get current head block number.
    pub async fn block_number(&self) -> Result<u64> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            Ok(provider.get_block_number().await?)
        })
        .await
    }

    /// Get chain ID.
    pub async fn chain_id(&self) -> Result<u64> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            Ok(provider.get_chain_id().await?)
        })
        .await
    }

    /// Get `(hash, parent_hash, timestamp)` for a block, if it exists.
    pub async fn block_header(&self, number: u64) -> Result<Option<(B256, B256, u64)>> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let block = provider.get_block_by_number(number.into()).await?;
            Ok(block.map(|b| (b.header.hash, b.header.parent_hash, b.header.timestamp)))
        })
        .await
    }

    /// Fetch logs for `filter` over `[from, to]`, paged by `page_size` blocks.
    ///
    /// Pages are fetched sequentially in ascending block order so the caller
    /// receives events already ordered by block. Ranges wholly behind the
    /// head go to the archive endpoint.
    pub async fn get_logs_paged(
        &self,
        filter: &Filter,
        from: u64,
        to: u64,
        page_size: u64,
        use_archive: bool,
    ) -> Result<Vec<Log>> {
        let url: alloy::transports::http::reqwest::Url = if use_archive {
            self.archive_url.parse()?
        } else {
            self.http_url.parse()?
        };

        let mut logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = (start + page_size - 1).min(to);
            let page_filter = filter.clone().from_block(start).to_block(end);

            let page = self
                .with_deadline(async {
                    let provider = ProviderBuilder::new().on_http(url.clone());
                    Ok(provider.get_logs(&page_filter).await?)
                })
                .await?;

            debug!(from = start, to = end, count = page.len(), "Fetched log page");
            logs.extend(page);
            start = end + 1;
        }

        Ok(logs)
    }

    /// Read the block timestamp for a block number.
    pub async fn block_timestamp(&self, number: u64) -> Result<Option<u64>> {
        Ok(self.block_header(number).await?.map(|(_, _, ts)| ts))
    }

    /// Hash of the transaction at `(block, tx_index)`, if mined. Used to
    /// confirm whether a predicted pending transaction landed where
    /// expected.
    pub async fn transaction_hash_at(&self, block: u64, tx_index: u64) -> Result<Option<B256>> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let tx: Option<serde_json::Value> = provider
                .raw_request(
                    "eth_getTransactionByBlockNumberAndIndex".into(),
                    (U64::from(block), U64::from(tx_index)),
                )
                .await?;
            Ok(tx
                .as_ref()
                .and_then(|t| t.get("hash"))
                .and_then(|h| h.as_str())
                .and_then(|s| s.parse().ok()))
        })
        .await
    }

    // Typed adapter reads. Each maps to one `eth_call` on the given contract.

    /// `getExchangeRate()` on a liquid-staking token.
    pub async fn exchange_rate(&self, token: Address) -> Result<U256> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let contract = IExchangeRateProvider::new(token, &provider);
            Ok(contract.getExchangeRate().call().await?._0)
        })
        .await
    }

    /// `ratio()` on a generic ratio provider.
    pub async fn ratio(&self, provider_addr: Address) -> Result<U256> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let contract = IRatioProvider::new(provider_addr, &provider);
            Ok(contract.ratio().call().await?._0)
        })
        .await
    }

    /// `latestAnswer()` on a Chainlink-style aggregator.
    pub async fn latest_answer(&self, aggregator: Address) -> Result<I256> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let contract = IChainlinkAggregator::new(aggregator, &provider);
            Ok(contract.latestAnswer().call().await?._0)
        })
        .await
    }

    /// ERC-20 name/symbol/decimals.
    pub async fn token_metadata(&self, token: Address) -> Result<TokenMetadata> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let contract = IERC20Metadata::new(token, &provider);
            let name_builder = contract.name();
            let symbol_builder = contract.symbol();
            let decimals_builder = contract.decimals();
            let name_call = name_builder.call();
            let symbol_call = symbol_builder.call();
            let decimals_call = decimals_builder.call();
            let (name, symbol, decimals) = tokio::join!(name_call, symbol_call, decimals_call);
            Ok(TokenMetadata {
                name: name?._0,
                symbol: symbol?._0,
                decimals: decimals?._0,
            })
        })
        .await
    }

    /// Read the sub-feeds a composite source references. Absent views are
    /// reported as `None` rather than errors: plain aggregators answer none
    /// of them.
    pub async fn composite_source_refs(&self, source: Address) -> Result<CompositeSourceRefs> {
        let url = self.http_url.parse()?;
        self.with_deadline(async {
            let provider = ProviderBuilder::new().on_http(url);
            let contract = ICompositeSource::new(source, &provider);
            let asset_to_usd_builder = contract.ASSET_TO_USD_AGGREGATOR();
            let base_to_usd_builder = contract.BASE_TO_USD_AGGREGATOR();
            let ratio_provider_builder = contract.RATIO_PROVIDER();
            let asset_to_usd_call = asset_to_usd_builder.call();
            let base_to_usd_call = base_to_usd_builder.call();
            let ratio_provider_call = ratio_provider_builder.call();
            let (asset_to_usd, base_to_usd, ratio_provider) =
                tokio::join!(asset_to_usd_call, base_to_usd_call, ratio_provider_call);
            Ok(CompositeSourceRefs {
                asset_to_usd: asset_to_usd.ok().map(|r| r._0).filter(|a| !a.is_zero()),
                base_to_usd: base_to_usd.ok().map(|r| r._0).filter(|a| !a.is_zero()),
                ratio_provider: ratio_provider.ok().map(|r| r._0).filter(|a| !a.is_zero()),
            })
        })
        .await
    }
}

/// Tracks recent block hashes and detects chain reorganizations.
///
/// Shallow reorgs (within `max_depth`) report the fork block so callers can
/// rewind watermarks and re-fetch; deeper mismatches are fatal.
pub struct ReorgTracker {
    /// `(block_number, hash)` ring, oldest first
    recent: Mutex<VecDeque<(u64, B256)>>,
    /// Maximum absorbable reorg depth
    max_depth: u64,
}

/// Outcome of observing one new head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadObservation {
    /// Head extends the known chain.
    Extends,
    /// Chain rewound; re-fetch from this block number (inclusive).
    RewindTo(u64),
}

impl ReorgTracker {
    pub fn new(max_depth: u64) -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            max_depth,
        }
    }

    /// Observe a new head. Returns how the head relates to the known chain,
    /// or `SyncError::ReorgTooDeep` when the fork point is beyond the ring.
    pub fn observe(
        &self,
        number: u64,
        hash: B256,
        parent_hash: B256,
    ) -> Result<HeadObservation, SyncError> {
        let mut recent = self.recent.lock();

        let outcome = match recent.back() {
            None => HeadObservation::Extends,
            Some(&(last_number, last_hash)) if number == last_number + 1 && parent_hash == last_hash => {
                HeadObservation::Extends
            }
            Some(_) => {
                // Walk back looking for the parent. Everything after it was
                // reorged out.
                let fork = recent
                    .iter()
                    .rev()
                    .find(|(n, h)| *n == number - 1 && *h == parent_hash)
                    .map(|(n, _)| *n);

                match fork {
                    Some(fork_number) => {
                        warn!(
                            head = number,
                            fork = fork_number,
                            "Chain reorganization detected, rewinding"
                        );
                        recent.retain(|(n, _)| *n <= fork_number);
                        HeadObservation::RewindTo(fork_number + 1)
                    }
                    None => {
                        // Same-height replacement is a depth-1 reorg.
                        if recent.iter().any(|(n, _)| *n == number.saturating_sub(1)) {
                            return Err(SyncError::ReorgTooDeep {
                                block: number,
                                depth: self.max_depth,
                            });
                        }
                        // Gap in observation (missed heads): treat as extension.
                        HeadObservation::Extends
                    }
                }
            }
        };

        recent.push_back((number, hash));
        while recent.len() as u64 > self.max_depth {
            recent.pop_front();
        }

        Ok(outcome)
    }

    /// Number of heads currently tracked.
    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> B256 {
        B256::repeat_byte(b)
    }

    #[test]
    fn test_extending_chain() {
        let tracker = ReorgTracker::new(32);
        assert_eq!(tracker.observe(100, h(1), h(0)).unwrap(), HeadObservation::Extends);
        assert_eq!(tracker.observe(101, h(2), h(1)).unwrap(), HeadObservation::Extends);
        assert_eq!(tracker.observe(102, h(3), h(2)).unwrap(), HeadObservation::Extends);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_shallow_reorg_rewinds() {
        let tracker = ReorgTracker::new(32);
        tracker.observe(100, h(1), h(0)).unwrap();
        tracker.observe(101, h(2), h(1)).unwrap();
        tracker.observe(102, h(3), h(2)).unwrap();

        // New 102 whose parent is the known 101: blocks from 102 were replaced.
        let obs = tracker.observe(102, h(0xA3), h(2)).unwrap();
        assert_eq!(obs, HeadObservation::RewindTo(102));
    }

    #[test]
    fn test_deep_reorg_fails() {
        let tracker = ReorgTracker::new(4);
        for i in 0..6u64 {
            tracker.observe(100 + i, h(i as u8 + 1), h(i as u8)).unwrap();
        }
        // Parent hash matches nothing retained: fork point beyond the ring.
        let err = tracker.observe(105, h(0xEE), h(0xDD)).unwrap_err();
        assert!(matches!(err, SyncError::ReorgTooDeep { .. }));
    }

    #[test]
    fn test_ring_bounded() {
        let tracker = ReorgTracker::new(4);
        for i in 0..20u64 {
            tracker.observe(i, h((i + 1) as u8), h(i as u8)).unwrap();
        }
        assert_eq!(tracker.len(), 4);
    }
}
