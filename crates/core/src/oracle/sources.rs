//! Underlying-source resolution.
//!
//! `AssetSourceUpdated` binds an asset to a source contract which may itself
//! reference sub-sources (composite adapters). Resolution walks the
//! reference graph breadth-first to a bounded depth and returns the union of
//! leaf feeds, which is the set of contracts the pipeline subscribes to for
//! that asset.

use std::collections::HashSet;

use alloy::primitives::Address;
use anyhow::Result;
use tracing::debug;

use sentinel_chain::ProviderManager;

use crate::error::OracleError;

/// Resolve the leaf feed set behind `root`.
///
/// Nodes deeper than `max_depth` fail with
/// [`OracleError::UnresolvedSource`]; cycles are tolerated (each contract is
/// visited once).
pub async fn resolve_leaf_sources(
    provider: &ProviderManager,
    root: Address,
    max_depth: u32,
) -> Result<Vec<Address>> {
    let mut visited: HashSet<Address> = HashSet::new();
    let mut leaves: Vec<Address> = Vec::new();
    let mut frontier: Vec<(Address, u32)> = vec![(root, 0)];

    while let Some((node, depth)) = frontier.pop() {
        if !visited.insert(node) {
            continue;
        }

        let children = provider.composite_source_refs(node).await?.children();
        if children.is_empty() {
            leaves.push(node);
            continue;
        }

        if depth + 1 > max_depth {
            return Err(OracleError::UnresolvedSource {
                source_address: root,
                depth: max_depth,
            }
            .into());
        }

        for child in children {
            frontier.push((child, depth + 1));
        }
    }

    debug!(root = %root, leaves = leaves.len(), "Resolved oracle source graph");
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    // Graph traversal against a live provider is covered by integration
    // environments; the depth arithmetic is exercised here.

    #[test]
    fn test_depth_limit_boundary() {
        // depth + 1 > max_depth rejects expansion at the boundary: a chain
        // of max_depth references resolves, one more does not.
        let max_depth = 8u32;
        let deepest_expandable = (0..).take_while(|d| d + 1 <= max_depth).last().unwrap();
        assert_eq!(deepest_expandable, 7);
    }
}
