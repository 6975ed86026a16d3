//! Oracle price composition.
//!
//! Rebuilds each asset's price from four independently-versioned component
//! streams (numerator, denominator, multiplier, max-cap), each materialized
//! twice: event-latest (confirmed on-chain) and transaction-latest
//! (predicted from a pending transaction). Multiplier values come from a
//! closed set of adapters; caps from stable or dynamic cap adapters; the
//! feed set behind a source is discovered by bounded graph resolution.

mod adapters;
mod caps;
mod composer;
mod growth;
mod sources;
mod streams;
mod types;

pub use adapters::{AdapterConfig, MultiplierAdapter};
pub use caps::{CapState, DynamicCapParameters};
pub use composer::{PriceComposer, SourceBinding};
pub use growth::GrowthEstimator;
pub use sources::resolve_leaf_sources;
pub use streams::{SourceStreams, Variant};
pub use types::{CapType, ComponentKind, ComponentVersions, ComposedPrice, PriceComponent};
