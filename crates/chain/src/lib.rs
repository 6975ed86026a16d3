//! Chain interaction layer.
//!
//! This crate provides:
//! - Contract bindings and topic-0 signatures for the monitored protocol
//! - Decoding of raw logs into the canonical [`LogEvent`] model
//! - Provider management with paged `eth_getLogs`, RPC deadlines, and
//!   reorg tracking
//! - WebSocket subscriptions with idle watchdog and reconnect backoff

pub mod contracts;
mod events;
mod listener;
mod provider;

pub use contracts::event_signatures;
pub use events::{
    decode_log, version, DecodeError, EventKind, EventPayload, LogEvent, StreamId, TokenResolver,
    TokenSide, ALL_KINDS,
};
pub use listener::{EventListener, NewHead, SubscriptionSpec};
pub use provider::{
    CompositeSourceRefs, HeadObservation, ProviderManager, ReorgTracker, SyncError, TokenMetadata,
};
