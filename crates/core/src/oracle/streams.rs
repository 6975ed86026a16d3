//! Versioned component stream state.
//!
//! Each asset source carries two projections of every component: the
//! event-latest (confirmed on-chain) and the transaction-latest (predicted
//! from a pending transaction). Both fold with insert-if-version-greater,
//! the in-memory equivalent of a replacing-by-version table.

use dashmap::DashMap;

use super::types::{ComponentKind, PriceComponent};

/// Which projection of a component stream to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Confirmed on-chain
    Event,
    /// Predicted from a pending transaction
    Transaction,
}

/// Component streams for one asset source.
#[derive(Default)]
pub struct SourceStreams {
    event: DashMap<ComponentKind, PriceComponent>,
    transaction: DashMap<ComponentKind, PriceComponent>,
}

impl SourceStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, variant: Variant) -> &DashMap<ComponentKind, PriceComponent> {
        match variant {
            Variant::Event => &self.event,
            Variant::Transaction => &self.transaction,
        }
    }

    /// Fold a new observation; older versions never overwrite newer state.
    /// Returns whether the observation was applied.
    pub fn insert_if_version_greater(
        &self,
        variant: Variant,
        kind: ComponentKind,
        component: PriceComponent,
    ) -> bool {
        let map = self.map(variant);
        let mut entry = map.entry(kind).or_insert(component);
        if component.version >= entry.version {
            *entry = component;
            true
        } else {
            false
        }
    }

    /// Latest observation of a component.
    pub fn get(&self, variant: Variant, kind: ComponentKind) -> Option<PriceComponent> {
        self.map(variant).get(&kind).map(|c| *c)
    }

    /// Latest event observation, which the transaction projection falls
    /// back to when no pending value exists.
    pub fn get_with_fallback(&self, kind: ComponentKind) -> Option<PriceComponent> {
        self.get(Variant::Transaction, kind).or_else(|| self.get(Variant::Event, kind))
    }
}
