//! Clients for external services.
//!
//! This crate provides:
//! - MEV-Share: pending-transaction hint stream (drives price prediction)
//! - Swap routes: the `(token_in, token_out)` path table used by candidates

mod mev_share;
mod swap_routes;

pub use mev_share::{MevShareClient, PendingCall, PendingHint, PendingLog};
pub use swap_routes::{SwapHop, SwapPath, SwapRouteTable};
