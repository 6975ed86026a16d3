//! Error taxonomy for the pipeline.
//!
//! Every failure belongs to one of five classes which decide its handling:
//! transient errors are retried without advancing watermarks, data-integrity
//! and fatal errors escalate to the operator, numeric and configuration
//! errors are contained to the offending event or asset.

use alloy::primitives::{Address, B256};
use thiserror::Error;

/// Handling class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; do not advance watermarks.
    Transient,
    /// Never resolve silently; surface for the operator.
    DataIntegrity,
    /// Fail the containing operation, record an error row, continue.
    Numeric,
    /// Mark the asset degraded and exclude it; other assets continue.
    Configuration,
    /// Halt the process; operator intervention required.
    Fatal,
}

/// Arithmetic failures in the fixed-point kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("result exceeds 256-bit capacity")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("consolidated balance is negative")]
    NegativeBalance,
}

/// Failures in the append-only event log store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("event version {version} behind watermark {watermark} and not a re-delivery")]
    OutOfOrder { version: u128, watermark: u128 },
    #[error("re-delivered event ({tx_hash}, {log_index}) differs from stored payload")]
    DuplicateMismatch { tx_hash: B256, log_index: u32 },
    #[error("event log store corrupted: {0}")]
    Corrupted(String),
}

/// Failures folding balance events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("no liquidity index available for asset {asset} at block {block}")]
    IndexUnavailable { asset: Address, block: u64 },
    #[error(transparent)]
    Math(#[from] MathError),
}

/// Configuration-class failures in the oracle subsystem.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("unknown multiplier adapter type '{0}'")]
    UnknownAdapter(String),
    #[error("source chain for {source_address} unresolved beyond depth {depth}")]
    UnresolvedSource { source_address: Address, depth: u32 },
    #[error("no decimals known for asset {0}")]
    MissingDecimals(Address),
    #[error("price component missing: {0}")]
    MissingComponent(&'static str),
    #[error(transparent)]
    Math(#[from] MathError),
}

impl MathError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Numeric
    }
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfOrder { .. } => ErrorClass::Transient,
            Self::DuplicateMismatch { .. } => ErrorClass::DataIntegrity,
            Self::Corrupted(_) => ErrorClass::Fatal,
        }
    }
}

impl BalanceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::IndexUnavailable { .. } => ErrorClass::Transient,
            Self::Math(e) => e.class(),
        }
    }
}

impl OracleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Math(e) => e.class(),
            _ => ErrorClass::Configuration,
        }
    }
}
