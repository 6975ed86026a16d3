//! Append-only store for decoded log events.
//!
//! One totally-ordered log per stream, keyed by the scalar version of the
//! `(block, tx_index, log_index)` ordering key. Re-deliveries are recognized
//! by `(tx_hash, log_index)` and absorbed; a re-delivery whose payload
//! differs from the stored event is a data-integrity failure that never
//! resolves silently. Watermarks advance only when an entire batch applies.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::B256;
use dashmap::DashMap;
use tracing::{debug, warn};

use sentinel_chain::{LogEvent, StreamId};

use crate::error::StoreError;

/// Outcome of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New event stored; watermark may have advanced.
    Appended,
    /// Exact re-delivery of a stored event; state unchanged.
    Duplicate,
}

#[derive(Default)]
struct StreamState {
    /// version → event, the totally-ordered log
    events: BTreeMap<u128, LogEvent>,
    /// delivery key → version, for re-delivery recognition
    deliveries: HashMap<(B256, u32), u128>,
    /// highest version successfully appended
    watermark: u128,
}

impl StreamState {
    fn check(&self, event: &LogEvent) -> Result<Option<AppendOutcome>, StoreError> {
        let version = event.version();

        if let Some(&stored_version) = self.deliveries.get(&event.delivery_key()) {
            let stored = self.events.get(&stored_version).ok_or_else(|| {
                StoreError::Corrupted(format!(
                    "delivery index references missing version {stored_version}"
                ))
            })?;
            if stored == event {
                return Ok(Some(AppendOutcome::Duplicate));
            }
            return Err(StoreError::DuplicateMismatch {
                tx_hash: event.tx_hash,
                log_index: event.log_index,
            });
        }

        if version < self.watermark {
            return Err(StoreError::OutOfOrder {
                version,
                watermark: self.watermark,
            });
        }

        Ok(None)
    }

    fn insert(&mut self, event: LogEvent) {
        let version = event.version();
        self.deliveries.insert(event.delivery_key(), version);
        self.events.insert(version, event);
        self.watermark = self.watermark.max(version);
    }
}

/// Append-only columnar event log, one ordered partition per stream.
pub struct EventLogStore {
    streams: DashMap<StreamId, StreamState>,
}

impl EventLogStore {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// Append one event. Idempotent on `(tx_hash, log_index)`.
    pub fn append(&self, stream: StreamId, event: LogEvent) -> Result<AppendOutcome, StoreError> {
        let mut state = self.streams.entry(stream).or_default();

        if let Some(outcome) = state.check(&event)? {
            debug!(stream = %stream, version = event.version(), "Absorbed re-delivered event");
            return Ok(outcome);
        }

        state.insert(event);
        Ok(AppendOutcome::Appended)
    }

    /// Append a batch atomically: the whole batch is validated before any
    /// event is stored, so a failure commits nothing. Returns the events
    /// that were newly appended (re-deliveries are filtered out).
    pub fn append_batch(
        &self,
        stream: StreamId,
        events: Vec<LogEvent>,
    ) -> Result<Vec<LogEvent>, StoreError> {
        let mut state = self.streams.entry(stream).or_default();

        // Validation pass. Watermark comparisons within the batch use the
        // running maximum so an in-batch regression is caught too.
        let mut running_watermark = state.watermark;
        let mut fresh = Vec::with_capacity(events.len());
        for event in &events {
            match state.check(event)? {
                Some(AppendOutcome::Duplicate) => continue,
                _ => {}
            }
            let version = event.version();
            if version < running_watermark {
                return Err(StoreError::OutOfOrder {
                    version,
                    watermark: running_watermark,
                });
            }
            running_watermark = running_watermark.max(version);
            fresh.push(event.clone());
        }

        // Commit pass.
        for event in &fresh {
            state.insert(event.clone());
        }

        if !fresh.is_empty() {
            debug!(
                stream = %stream,
                appended = fresh.len(),
                watermark = state.watermark,
                "Batch appended"
            );
        }
        Ok(fresh)
    }

    /// Events in `[from_version, to_version]`, in ordering-key order.
    pub fn range(&self, stream: StreamId, from_version: u128, to_version: u128) -> Vec<LogEvent> {
        self.streams
            .get(&stream)
            .map(|state| {
                state
                    .events
                    .range(from_version..=to_version)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest version successfully appended to a stream (0 when empty).
    pub fn watermark(&self, stream: StreamId) -> u128 {
        self.streams.get(&stream).map(|s| s.watermark).unwrap_or(0)
    }

    /// Rewind a stream to `version` after a chain reorganization: events
    /// above it are dropped so the affected range can be re-fetched.
    pub fn truncate_above(&self, stream: StreamId, version: u128) {
        if let Some(mut state) = self.streams.get_mut(&stream) {
            let removed: Vec<u128> = state
                .events
                .range((
                    std::ops::Bound::Excluded(version),
                    std::ops::Bound::Unbounded,
                ))
                .map(|(v, _)| *v)
                .collect();

            if removed.is_empty() {
                return;
            }
            warn!(
                stream = %stream,
                removed = removed.len(),
                to_version = version,
                "Truncating stream after reorganization"
            );

            for v in removed {
                if let Some(event) = state.events.remove(&v) {
                    state.deliveries.remove(&event.delivery_key());
                }
            }
            state.watermark = state.events.keys().next_back().copied().unwrap_or(0);
        }
    }

    /// Number of events held for a stream.
    pub fn len(&self, stream: StreamId) -> usize {
        self.streams.get(&stream).map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, stream: StreamId) -> bool {
        self.len(stream) == 0
    }
}

impl Default for EventLogStore {
    fn default() -> Self {
        Self::new()
    }
}
