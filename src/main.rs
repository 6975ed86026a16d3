//! Solvency sentinel.
//!
//! Maintains a real-time materialization of every borrower's position on an
//! Aave-v3-style pool and surfaces profitable liquidations:
//! - Event-driven ingestion (backfill + websocket streaming per stream)
//! - Scaled-balance, index, configuration and price materializations
//! - Health-factor evaluation with forward interest projection
//! - Candidate selection with flash-loan sizing and swap routing

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_api::{MevShareClient, SwapRouteTable};
use sentinel_chain::{event_signatures, EventKind, EventListener, ProviderManager, StreamId};
use sentinel_core::oracle::{AdapterConfig, MultiplierAdapter, PriceComposer, SourceBinding};
use sentinel_core::{
    config, init_config, CandidateEngine, ConfigProjection, EventLogStore, EventRouter,
    HealthEvaluator, LiquidityIndexTracker, ScaledBalanceAggregator, SentinelConfig, StreamSpec,
    SubmissionLog, SyncCoordinator,
};

/// Environment variable names.
mod env {
    pub const DEPLOYMENT: &str = "SENTINEL_DEPLOYMENT";
    pub const SWAP_ROUTES: &str = "SENTINEL_SWAP_ROUTES";
}

/// Deployment description: the contracts one chain deployment watches.
#[derive(Debug, Deserialize)]
struct Deployment {
    pool: Address,
    pool_configurator: Address,
    oracle_registry: Address,
    /// Scaled-token contracts (aTokens and variable-debt tokens)
    #[serde(default)]
    tokens: Vec<Address>,
    #[serde(default, rename = "source")]
    sources: Vec<SourceConfig>,
}

/// One asset-source declaration.
#[derive(Debug, Deserialize)]
struct SourceConfig {
    asset: Address,
    root_source: Address,
    numerator_feed: Address,
    #[serde(default)]
    denominator_feed: Option<Address>,
    #[serde(default)]
    cap_feed: Option<Address>,
    #[serde(default = "default_feed_decimals")]
    feed_decimals: u8,
    adapter: AdapterConfig,
}

fn default_feed_decimals() -> u8 {
    8
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sentinel_core=debug,sentinel_chain=debug")),
        )
        .init();

    let cfg = SentinelConfig::from_env()?;
    cfg.log_config();
    init_config(cfg);

    let deployment = load_deployment()?;
    info!(
        pool = %deployment.pool,
        sources = deployment.sources.len(),
        tokens = deployment.tokens.len(),
        "Deployment loaded"
    );

    let coordinator = initialize(deployment).await?;
    info!("Starting synchronization");
    coordinator.run().await
}

fn load_deployment() -> Result<Deployment> {
    let path = std::env::var(env::DEPLOYMENT)
        .map_err(|_| anyhow::anyhow!("Missing env var: {}", env::DEPLOYMENT))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading deployment file {path}"))?;
    toml::from_str(&text).context("parsing deployment file")
}

fn load_swap_routes() -> Result<SwapRouteTable> {
    let path = std::env::var(env::SWAP_ROUTES)
        .map_err(|_| anyhow::anyhow!("Missing env var: {}", env::SWAP_ROUTES))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading swap route file {path}"))?;
    SwapRouteTable::from_toml_str(&text)
}

async fn initialize(deployment: Deployment) -> Result<Arc<SyncCoordinator>> {
    let cfg = config();

    // Chain access
    let provider = Arc::new(
        ProviderManager::new(&cfg.rpc_url_http, &cfg.rpc_url_http, cfg.rpc_timeout()).await?,
    );
    let listener = Arc::new(EventListener::new(&cfg.rpc_url_ws, cfg.ws_idle_timeout()));

    // Materializations
    let store = Arc::new(EventLogStore::new());
    let indices = Arc::new(LiquidityIndexTracker::new());
    let balances = Arc::new(ScaledBalanceAggregator::new(
        indices.clone(),
        cfg.track_stable_debt,
    ));
    let projection = Arc::new(ConfigProjection::new());
    let composer = Arc::new(PriceComposer::new(cfg.growth_window()));

    // Oracle source registration; unknown adapter kinds degrade the asset
    // and leave the rest of the deployment running.
    let mut adapters: Vec<(Address, MultiplierAdapter)> = Vec::new();
    for source in &deployment.sources {
        match MultiplierAdapter::from_config(&source.adapter) {
            Ok(adapter) => {
                adapters.push((source.root_source, adapter.clone()));
                composer.register_source(SourceBinding {
                    asset: source.asset,
                    root_source: source.root_source,
                    numerator_feed: source.numerator_feed,
                    denominator_feed: source.denominator_feed,
                    cap_feed: source.cap_feed,
                    adapter,
                    feed_decimals: source.feed_decimals,
                });
            }
            Err(e) => {
                warn!(asset = %source.asset, error = %e, "Source initialization failed");
                projection.mark_degraded(source.asset, e.to_string());
            }
        }
    }
    projection.publish();

    let evaluator = Arc::new(HealthEvaluator::new(
        balances.clone(),
        indices.clone(),
        composer.clone(),
        projection.clone(),
    ));

    let routes = Arc::new(load_swap_routes()?);
    let engine = Arc::new(CandidateEngine::new(evaluator.clone(), routes));
    let submissions = Arc::new(SubmissionLog::new());

    let router = Arc::new(EventRouter {
        balances,
        indices,
        projection,
        composer: composer.clone(),
    });

    let specs = stream_specs(&deployment);
    let coordinator = Arc::new(SyncCoordinator::new(
        provider.clone(),
        listener,
        store,
        router,
        specs,
    ));

    spawn_mempool_pump(composer.clone(), &deployment);
    spawn_multiplier_poll(composer, provider, adapters, coordinator.clone());
    spawn_evaluation_loop(evaluator, engine, submissions, coordinator.clone());

    info!("All components initialized");
    Ok(coordinator)
}

/// One stream per (event kind, contract), per the stream identity model.
fn stream_specs(deployment: &Deployment) -> Vec<StreamSpec> {
    let chain_id = config().chain_id;
    let mut specs = Vec::new();
    let mut push = |kind: EventKind, contract: Address| {
        specs.push(StreamSpec::new(StreamId::new(chain_id, kind, contract)));
    };

    for kind in [
        EventKind::ReserveDataUpdated,
        EventKind::ReserveUsedAsCollateralEnabled,
        EventKind::ReserveUsedAsCollateralDisabled,
        EventKind::UserEModeSet,
    ] {
        push(kind, deployment.pool);
    }
    for kind in [
        EventKind::ReserveInitialized,
        EventKind::CollateralConfigurationChanged,
        EventKind::EModeAssetCategoryChanged,
        EventKind::EModeCategoryAdded,
    ] {
        push(kind, deployment.pool_configurator);
    }
    push(EventKind::AssetSourceUpdated, deployment.oracle_registry);

    for token in &deployment.tokens {
        for kind in [EventKind::Mint, EventKind::Burn, EventKind::BalanceTransfer] {
            push(kind, *token);
        }
    }
    for source in &deployment.sources {
        push(EventKind::NewTransmission, source.numerator_feed);
        push(EventKind::AnswerUpdated, source.numerator_feed);
        if let Some(feed) = source.denominator_feed {
            push(EventKind::AnswerUpdated, feed);
        }
        if let Some(cap) = source.cap_feed {
            push(EventKind::PriceCapUpdated, cap);
            push(EventKind::CapParametersUpdated, cap);
        }
    }

    specs
}

/// Pending-transaction pump: MEV-Share hints drive the transaction-latest
/// numerator streams.
fn spawn_mempool_pump(composer: Arc<PriceComposer>, deployment: &Deployment) {
    let sse_url = config().mev_share_ws.clone();
    if sse_url.is_empty() {
        info!("No MEV-Share endpoint configured, prediction runs on event data only");
        return;
    }

    let feeds: HashSet<Address> = deployment.sources.iter().map(|s| s.numerator_feed).collect();
    tokio::spawn(async move {
        use futures::StreamExt;

        let topics = HashSet::from([
            event_signatures::NEW_TRANSMISSION,
            event_signatures::ANSWER_UPDATED,
        ]);
        let client = MevShareClient::new(sse_url);
        let mut hints = match client.subscribe(topics.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "MEV-Share pump failed to start");
                return;
            }
        };

        while let Some(hint) = hints.next().await {
            let now = unix_now();
            for log in hint.matching_logs(&topics) {
                if !feeds.contains(&log.address) {
                    continue;
                }
                let Some(answer) = pending_answer(log) else {
                    continue;
                };
                composer.apply_pending(log.address, answer, unix_nanos(), now);
                debug!(feed = %log.address, answer = %answer, "Applied pending transmission");
            }
        }
    });
}

/// Extract the transmitted answer from a pending transmission log.
fn pending_answer(log: &sentinel_api::PendingLog) -> Option<alloy::primitives::U256> {
    use alloy::primitives::I256;

    let topic0 = log.topic0()?;
    let answer = if topic0 == event_signatures::NEW_TRANSMISSION {
        if log.data.len() < 32 {
            return None;
        }
        let mut word = [0u8; 32];
        word.copy_from_slice(&log.data[..32]);
        I256::from_be_bytes(word)
    } else if topic0 == event_signatures::ANSWER_UPDATED {
        I256::from_be_bytes(log.topics.get(1)?.0)
    } else {
        return None;
    };

    if answer.is_negative() {
        return None;
    }
    Some(answer.unsigned_abs())
}

/// Periodic multiplier refresh through each source's adapter.
fn spawn_multiplier_poll(
    composer: Arc<PriceComposer>,
    provider: Arc<ProviderManager>,
    adapters: Vec<(Address, MultiplierAdapter)>,
    coordinator: Arc<SyncCoordinator>,
) {
    if adapters.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let now = unix_now();
            let block = coordinator.head();
            for (source, adapter) in &adapters {
                match adapter.fetch(&provider, now).await {
                    Ok(multiplier) => {
                        composer.update_multiplier(*source, multiplier, unix_nanos(), block, now);
                    }
                    Err(e) => {
                        warn!(source = %source, error = %e, "Multiplier fetch failed");
                    }
                }
            }
        }
    });
}

/// Evaluation loop: re-derive positions and re-rank candidates each tick.
fn spawn_evaluation_loop(
    evaluator: Arc<HealthEvaluator>,
    engine: Arc<CandidateEngine>,
    submissions: Arc<SubmissionLog>,
    coordinator: Arc<SyncCoordinator>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config().tick_interval());
        loop {
            tick.tick().await;
            let block = coordinator.head();
            if block == 0 {
                continue;
            }
            let now = unix_now();

            for user in evaluator.known_users() {
                evaluator.evaluate_user(user, block, now);
            }

            let candidates = engine.tick();
            if !candidates.is_empty() {
                info!(
                    count = candidates.len(),
                    top_profit = candidates[0].expected_profit_usd,
                    builders = submissions.all_builders().len(),
                    "Candidates ready for submission"
                );
            }
        }
    });
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Print startup banner.
fn print_banner() {
    println!(
        r#"
    ╔═╗┌─┐┌┐┌┌┬┐┬┌┐┌┌─┐┬
    ╚═╗├┤ │││ │ │││││├┤ │
    ╚═╝└─┘┘└┘ ┴ ┴┘└┘└─┘┴─┘
    Solvency Sentinel v0.1.0
    "#
    );
}
