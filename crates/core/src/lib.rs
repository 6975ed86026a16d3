//! Core solvency-materialization and liquidation pipeline.
//!
//! This crate provides:
//! - Ray-math kernel with 512-bit intermediates and explicit rounding
//! - Append-only event log store with per-stream watermarks
//! - Scaled balance aggregation from Mint/Burn/Transfer events
//! - Liquidity index and interest rate tracking
//! - Oracle price composition (four streams, adapters, caps, prediction)
//! - Configuration projection with e-mode denormalization
//! - Health-factor evaluation with forward interest projection
//! - Liquidation candidate selection with swap routing
//! - Synchronization coordination (backfill/streaming, backoff, degraded
//!   stream handling)

mod balances;
mod candidates;
pub mod config;
mod coordinator;
mod error;
mod health;
mod indices;
pub mod oracle;
mod projection;
pub mod ray_math;
mod store;
mod submissions;

pub use balances::{ScaledBalance, ScaledBalanceAggregator};
pub use candidates::{CandidateEngine, LiquidationCandidate};
pub use config::{config, init_config, HealthBand, SentinelConfig};
pub use coordinator::{
    backoff_delay, sync_mode, EventRouter, StreamSpec, SyncCoordinator, SyncMode,
};
pub use error::{BalanceError, ErrorClass, MathError, OracleError, StoreError};
pub use health::{AssetRow, HealthEvaluator, HealthPosition, HEALTH_FACTOR_INFINITY};
pub use indices::{BlockIndexes, IndexSnapshot, LiquidityIndexTracker};
pub use projection::{AssetConfigView, ConfigProjection, EModeCategory, Versioned};
pub use store::{AppendOutcome, EventLogStore};
pub use submissions::{BuilderStats, SubmissionLog, SubmissionRecord};
