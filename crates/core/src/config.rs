//! Runtime configuration.
//!
//! All tunables live in one serde-backed structure with per-field defaults,
//! loadable from a TOML file and overridable from the environment. The
//! resolved configuration is published once at startup through
//! [`init_config`] and read everywhere via [`config`].

use std::sync::OnceLock;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

static CONFIG: OnceLock<SentinelConfig> = OnceLock::new();

/// Install the process-wide configuration. Later calls are ignored.
pub fn init_config(config: SentinelConfig) {
    let _ = CONFIG.set(config);
}

/// The process-wide configuration. Falls back to defaults when
/// [`init_config`] was never called (tests).
pub fn config() -> &'static SentinelConfig {
    CONFIG.get_or_init(SentinelConfig::default)
}

/// Admission band for liquidation candidates: `min < hf <= max`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthBand {
    #[serde(default = "default_band_min")]
    pub min: f64,
    #[serde(default = "default_band_max")]
    pub max: f64,
}

fn default_band_min() -> f64 {
    1.0
}
fn default_band_max() -> f64 {
    1.25
}

impl Default for HealthBand {
    fn default() -> Self {
        Self {
            min: default_band_min(),
            max: default_band_max(),
        }
    }
}

impl HealthBand {
    /// Whether a health factor falls in the half-open band `(min, max]`.
    pub fn admits(&self, hf: f64) -> bool {
        hf > self.min && hf <= self.max
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Chain ID of the monitored deployment
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Columnar database endpoint (persisted event tables)
    #[serde(default)]
    pub database_url: String,

    /// Redis endpoint (shared operational state)
    #[serde(default)]
    pub redis_url: String,

    /// HTTP RPC endpoint
    #[serde(default)]
    pub rpc_url_http: String,

    /// WebSocket RPC endpoint
    #[serde(default)]
    pub rpc_url_ws: String,

    /// MEV-Share SSE endpoint
    #[serde(default)]
    pub mev_share_ws: String,

    /// Backfill-vs-streaming switchover distance from head (blocks)
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold_blocks: u64,

    /// Maximum absorbable chain reorganization depth (blocks)
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,

    /// Per-request RPC deadline (milliseconds)
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Candidate admission band
    #[serde(default)]
    pub candidate_health_band: HealthBand,

    /// Minimum effective collateral and debt (USD) for candidacy
    #[serde(default = "default_candidate_min_usd")]
    pub candidate_min_usd: f64,

    /// Maximum fraction of debt one liquidation may cover
    #[serde(default = "default_close_factor")]
    pub close_factor: f64,

    /// Debt assets scanned first, in order
    #[serde(default)]
    pub priority_debt_assets: Vec<Address>,

    /// Collateral assets preferred at equal profit, in order
    #[serde(default)]
    pub priority_collateral_assets: Vec<Address>,

    /// Recursive oracle source resolution depth limit
    #[serde(default = "default_max_source_depth")]
    pub max_oracle_source_depth: u32,

    /// Multiplier growth regression window (days)
    #[serde(default = "default_growth_window_days")]
    pub multiplier_growth_window_days: u64,

    /// Extrapolation factor applied to projected interest accrual
    #[serde(default = "default_accrual_projection_factor")]
    pub accrual_projection_factor: f64,

    /// Whether stable-debt token events are folded into balances
    #[serde(default)]
    pub track_stable_debt: bool,

    /// Expected seconds between blocks on the monitored chain
    #[serde(default = "default_seconds_per_block")]
    pub seconds_per_block: f64,

    /// Bounded per-stream ingestion queue size (events)
    #[serde(default = "default_ingest_queue_size")]
    pub ingest_queue_size: usize,

    /// Consecutive failures before a stream is marked degraded
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Parent scheduling tick (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// WebSocket read-idle watchdog (seconds)
    #[serde(default = "default_ws_idle_timeout_secs")]
    pub ws_idle_timeout_secs: u64,

    /// Block-range page size for backfill `eth_getLogs`
    #[serde(default = "default_backfill_page_blocks")]
    pub backfill_page_blocks: u64,
}

fn default_chain_id() -> u64 {
    1
}
fn default_streaming_threshold() -> u64 {
    1000
}
fn default_reorg_depth() -> u64 {
    32
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_candidate_min_usd() -> f64 {
    10_000.0
}
fn default_close_factor() -> f64 {
    0.5
}
fn default_max_source_depth() -> u32 {
    8
}
fn default_growth_window_days() -> u64 {
    7
}
fn default_accrual_projection_factor() -> f64 {
    1.0
}
fn default_seconds_per_block() -> f64 {
    12.0
}
fn default_ingest_queue_size() -> usize {
    10_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_ws_idle_timeout_secs() -> u64 {
    30
}
fn default_backfill_page_blocks() -> u64 {
    2000
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            database_url: String::new(),
            redis_url: String::new(),
            rpc_url_http: String::new(),
            rpc_url_ws: String::new(),
            mev_share_ws: String::new(),
            streaming_threshold_blocks: default_streaming_threshold(),
            reorg_depth: default_reorg_depth(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            candidate_health_band: HealthBand::default(),
            candidate_min_usd: default_candidate_min_usd(),
            close_factor: default_close_factor(),
            priority_debt_assets: Vec::new(),
            priority_collateral_assets: Vec::new(),
            max_oracle_source_depth: default_max_source_depth(),
            multiplier_growth_window_days: default_growth_window_days(),
            accrual_projection_factor: default_accrual_projection_factor(),
            track_stable_debt: false,
            seconds_per_block: default_seconds_per_block(),
            ingest_queue_size: default_ingest_queue_size(),
            max_retries: default_max_retries(),
            tick_interval_ms: default_tick_interval_ms(),
            ws_idle_timeout_secs: default_ws_idle_timeout_secs(),
            backfill_page_blocks: default_backfill_page_blocks(),
        }
    }
}

impl SentinelConfig {
    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing configuration")
    }

    /// Load from the file named by `SENTINEL_CONFIG` (if set), then apply
    /// endpoint overrides from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SENTINEL_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                Self::from_toml_str(&text)?
            }
            Err(_) => Self::default(),
        };

        let overrides = [
            ("DATABASE_URL", &mut config.database_url),
            ("REDIS_URL", &mut config.redis_url),
            ("RPC_URL_HTTP", &mut config.rpc_url_http),
            ("RPC_URL_WS", &mut config.rpc_url_ws),
            ("MEV_SHARE_WS", &mut config.mev_share_ws),
        ];
        for (name, slot) in overrides {
            if let Ok(value) = std::env::var(name) {
                *slot = value;
            }
        }
        if let Ok(value) = std::env::var("CHAIN_ID") {
            config.chain_id = value.parse().context("parsing CHAIN_ID")?;
        }

        Ok(config)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn ws_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_idle_timeout_secs)
    }

    pub fn growth_window(&self) -> Duration {
        Duration::from_secs(self.multiplier_growth_window_days * 86_400)
    }

    /// Log the resolved configuration at startup.
    pub fn log_config(&self) {
        info!(
            chain_id = self.chain_id,
            streaming_threshold = self.streaming_threshold_blocks,
            reorg_depth = self.reorg_depth,
            rpc_timeout_ms = self.rpc_timeout_ms,
            band_min = self.candidate_health_band.min,
            band_max = self.candidate_health_band.max,
            candidate_min_usd = self.candidate_min_usd,
            close_factor = self.close_factor,
            "Configuration resolved"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::default();
        assert_eq!(config.streaming_threshold_blocks, 1000);
        assert_eq!(config.reorg_depth, 32);
        assert_eq!(config.rpc_timeout_ms, 5000);
        assert_eq!(config.candidate_min_usd, 10_000.0);
        assert_eq!(config.close_factor, 0.5);
        assert_eq!(config.max_oracle_source_depth, 8);
        assert_eq!(config.multiplier_growth_window_days, 7);
        assert_eq!(config.accrual_projection_factor, 1.0);
        assert!(!config.track_stable_debt);
    }

    #[test]
    fn test_band_half_open() {
        let band = HealthBand::default();
        assert!(!band.admits(1.0));
        assert!(band.admits(1.0001));
        assert!(band.admits(1.25));
        assert!(!band.admits(1.2501));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = SentinelConfig::from_toml_str(
            r#"
chain_id = 10
close_factor = 0.4

[candidate_health_band]
max = 1.5
"#,
        )
        .unwrap();

        assert_eq!(config.chain_id, 10);
        assert_eq!(config.close_factor, 0.4);
        assert_eq!(config.candidate_health_band.max, 1.5);
        // Untouched fields keep their defaults
        assert_eq!(config.candidate_health_band.min, 1.0);
        assert_eq!(config.reorg_depth, 32);
    }
}
