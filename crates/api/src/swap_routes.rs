//! Swap-route table for liquidation execution.
//!
//! Candidates need two routes: collateral → debt (exact-output, repays the
//! flash loan) and collateral → WETH (exact-input, converts residual profit).
//! Routes are declared in a TOML table; a missing direct pair is synthesized
//! through WETH when both legs exist, and unresolvable pairs are recorded so
//! operators can extend the table.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One hop of a swap path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapHop {
    pub token_in: Address,
    pub token_out: Address,
    /// Pool fee tier in hundredths of a bip (e.g. 3000 = 0.3%)
    pub fee: u32,
}

/// A multi-hop swap path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapPath {
    /// Token sequence, first = input, last = output
    pub tokens: Vec<Address>,
    /// Fee tier per hop; `fees.len() == tokens.len() - 1`
    pub fees: Vec<u32>,
}

impl SwapPath {
    /// Single-hop path.
    pub fn direct(token_in: Address, token_out: Address, fee: u32) -> Self {
        Self {
            tokens: vec![token_in, token_out],
            fees: vec![fee],
        }
    }

    pub fn token_in(&self) -> Option<Address> {
        self.tokens.first().copied()
    }

    pub fn token_out(&self) -> Option<Address> {
        self.tokens.last().copied()
    }

    /// Structural validity: at least two tokens, one fee per hop.
    pub fn is_valid(&self) -> bool {
        self.tokens.len() >= 2 && self.fees.len() == self.tokens.len() - 1
    }

    /// Expand into hops.
    pub fn hops(&self) -> Vec<SwapHop> {
        self.tokens
            .windows(2)
            .zip(&self.fees)
            .map(|(pair, &fee)| SwapHop {
                token_in: pair[0],
                token_out: pair[1],
                fee,
            })
            .collect()
    }

    /// Concatenate with another path whose input is this path's output.
    fn join(&self, tail: &SwapPath) -> Option<SwapPath> {
        if self.token_out() != tail.token_in() {
            return None;
        }
        let mut tokens = self.tokens.clone();
        tokens.extend(tail.tokens.iter().skip(1).copied());
        let mut fees = self.fees.clone();
        fees.extend(tail.fees.iter().copied());
        Some(SwapPath { tokens, fees })
    }
}

/// TOML shape of one declared route.
#[derive(Debug, Deserialize)]
struct RouteEntry {
    tokens: Vec<Address>,
    fees: Vec<u32>,
}

/// TOML shape of the whole table.
#[derive(Debug, Deserialize)]
struct RouteFile {
    weth: Address,
    #[serde(default, rename = "route")]
    routes: Vec<RouteEntry>,
}

/// In-memory `(token_in, token_out) → path` table.
pub struct SwapRouteTable {
    routes: DashMap<(Address, Address), SwapPath>,
    /// Pairs that failed resolution, with a miss counter
    missing: DashMap<(Address, Address), u64>,
    weth: Address,
}

impl SwapRouteTable {
    /// Empty table routing profit through `weth`.
    pub fn new(weth: Address) -> Self {
        Self {
            routes: DashMap::new(),
            missing: DashMap::new(),
            weth,
        }
    }

    /// Load from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: RouteFile = toml::from_str(text).context("parsing swap route table")?;
        let table = Self::new(file.weth);

        for entry in file.routes {
            let path = SwapPath {
                tokens: entry.tokens,
                fees: entry.fees,
            };
            if !path.is_valid() {
                anyhow::bail!(
                    "invalid route: {} tokens, {} fees",
                    path.tokens.len(),
                    path.fees.len()
                );
            }
            table.insert(path);
        }

        debug!(routes = table.routes.len(), "Loaded swap route table");
        Ok(table)
    }

    /// The profit-conversion target token.
    pub fn weth(&self) -> Address {
        self.weth
    }

    /// Register a path under its endpoint pair.
    pub fn insert(&self, path: SwapPath) {
        if let (Some(token_in), Some(token_out)) = (path.token_in(), path.token_out()) {
            self.routes.insert((token_in, token_out), path);
        }
    }

    /// Look up a path, synthesizing a two-leg route through WETH when the
    /// direct pair is absent. Identity pairs need no path and return `None`
    /// without being recorded as missing.
    pub fn lookup(&self, token_in: Address, token_out: Address) -> Option<SwapPath> {
        if token_in == token_out {
            return None;
        }

        if let Some(path) = self.routes.get(&(token_in, token_out)) {
            return Some(path.clone());
        }

        // Two-leg synthesis through WETH.
        if token_in != self.weth && token_out != self.weth {
            let first = self.routes.get(&(token_in, self.weth)).map(|p| p.clone());
            let second = self.routes.get(&(self.weth, token_out)).map(|p| p.clone());
            if let (Some(first), Some(second)) = (first, second) {
                if let Some(joined) = first.join(&second) {
                    return Some(joined);
                }
            }
        }

        let mut count = self.missing.entry((token_in, token_out)).or_insert(0);
        *count += 1;
        if *count == 1 {
            warn!(token_in = %token_in, token_out = %token_out, "No swap route for pair");
        }
        None
    }

    /// Pairs that have failed resolution, with miss counts.
    pub fn missing_pairs(&self) -> Vec<(Address, Address, u64)> {
        self.missing
            .iter()
            .map(|e| (e.key().0, e.key().1, *e.value()))
            .collect()
    }

    /// Number of declared routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[test]
    fn test_direct_lookup() {
        let table = SwapRouteTable::new(addr(0xEE));
        table.insert(SwapPath::direct(addr(1), addr(2), 3000));

        let path = table.lookup(addr(1), addr(2)).expect("direct route");
        assert_eq!(path.hops().len(), 1);
        assert_eq!(path.hops()[0].fee, 3000);
    }

    #[test]
    fn test_weth_synthesis() {
        let weth = addr(0xEE);
        let table = SwapRouteTable::new(weth);
        table.insert(SwapPath::direct(addr(1), weth, 500));
        table.insert(SwapPath::direct(weth, addr(2), 3000));

        let path = table.lookup(addr(1), addr(2)).expect("synthesized route");
        assert_eq!(path.tokens, vec![addr(1), weth, addr(2)]);
        assert_eq!(path.fees, vec![500, 3000]);
    }

    #[test]
    fn test_missing_recorded() {
        let table = SwapRouteTable::new(addr(0xEE));
        assert!(table.lookup(addr(1), addr(2)).is_none());
        assert!(table.lookup(addr(1), addr(2)).is_none());

        let missing = table.missing_pairs();
        assert_eq!(missing, vec![(addr(1), addr(2), 2)]);
    }

    #[test]
    fn test_identity_pair_not_missing() {
        let table = SwapRouteTable::new(addr(0xEE));
        assert!(table.lookup(addr(1), addr(1)).is_none());
        assert!(table.missing_pairs().is_empty());
    }

    #[test]
    fn test_toml_round_trip() {
        let weth = addr(0xEE);
        let text = format!(
            r#"
weth = "{weth}"

[[route]]
tokens = ["{a}", "{b}"]
fees = [3000]
"#,
            weth = weth,
            a = addr(1),
            b = addr(2),
        );

        let table = SwapRouteTable::from_toml_str(&text).expect("parse");
        assert_eq!(table.len(), 1);
        assert!(table.lookup(addr(1), addr(2)).is_some());
    }
}
