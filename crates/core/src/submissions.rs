//! Submission outcome log.
//!
//! The engine hands candidates to an external submitter; this table records
//! what came back, per builder, so operators can see which builders land
//! bundles and which reject them.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One submission attempt and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub builder: String,
    pub user: Address,
    pub collateral_asset: Address,
    pub debt_asset: Address,
    pub expected_profit_usd: f64,
    pub nonce: u64,
    pub target_block: u64,
    pub bundle_hash: Option<B256>,
    pub tx_hash: Option<B256>,
    pub debt_to_cover: U256,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-builder outcome counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BuilderStats {
    pub submitted: u64,
    pub succeeded: u64,
}

impl BuilderStats {
    pub fn success_rate(&self) -> f64 {
        if self.submitted == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.submitted as f64
    }
}

/// Memory-resident submission log.
pub struct SubmissionLog {
    rows: RwLock<Vec<SubmissionRecord>>,
    by_builder: DashMap<String, BuilderStats>,
}

impl SubmissionLog {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            by_builder: DashMap::new(),
        }
    }

    /// Record one outcome.
    pub fn record(&self, record: SubmissionRecord) {
        let mut stats = self.by_builder.entry(record.builder.clone()).or_default();
        stats.submitted += 1;
        if record.success {
            stats.succeeded += 1;
        }
        drop(stats);

        self.rows.write().push(record);
    }

    /// The most recent `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SubmissionRecord> {
        let rows = self.rows.read();
        rows.iter().rev().take(limit).cloned().collect()
    }

    /// Outcome counters for one builder.
    pub fn builder_stats(&self, builder: &str) -> BuilderStats {
        self.by_builder.get(builder).map(|s| *s).unwrap_or_default()
    }

    /// All builders with their counters.
    pub fn all_builders(&self) -> Vec<(String, BuilderStats)> {
        self.by_builder
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl Default for SubmissionLog {
    fn default() -> Self {
        Self::new()
    }
}
