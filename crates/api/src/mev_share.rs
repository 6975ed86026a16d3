//! MEV-Share event-stream client.
//!
//! Consumes the SSE firehose of pending-transaction hints and yields the
//! subset whose revealed logs match a configured topic-0 set. Hints feed the
//! transaction-latest side of the price component streams: a pending
//! transmission shows tomorrow's numerator before it mines.

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use anyhow::Result;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Initial reconnect backoff.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A log revealed by a pending transaction hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
}

impl PendingLog {
    /// Topic-0, if the hint revealed it.
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

/// A calldata hint for a pending transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub function_selector: Option<Bytes>,
    #[serde(default)]
    pub call_data: Option<Bytes>,
}

/// One pending-transaction hint from the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHint {
    pub hash: B256,
    #[serde(default)]
    pub logs: Vec<PendingLog>,
    #[serde(default)]
    pub txs: Vec<PendingCall>,
}

impl PendingHint {
    /// Logs whose topic-0 is in `topics`.
    pub fn matching_logs<'a>(
        &'a self,
        topics: &'a HashSet<B256>,
    ) -> impl Iterator<Item = &'a PendingLog> {
        self.logs
            .iter()
            .filter(|log| log.topic0().is_some_and(|t| topics.contains(&t)))
    }
}

/// MEV-Share SSE client.
#[derive(Clone)]
pub struct MevShareClient {
    client: reqwest::Client,
    sse_url: String,
}

impl std::fmt::Debug for MevShareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MevShareClient").field("sse_url", &self.sse_url).finish()
    }
}

impl MevShareClient {
    /// Create a client for the given SSE endpoint.
    pub fn new(sse_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            sse_url: sse_url.into(),
        }
    }

    /// Subscribe to pending-transaction hints whose logs match `topic_filter`.
    ///
    /// The stream reconnects with exponential backoff on disconnect and only
    /// ends when dropped. Hints with no matching log are filtered out here so
    /// consumers never see unrelated mempool traffic.
    pub async fn subscribe(
        &self,
        topic_filter: HashSet<B256>,
    ) -> Result<Pin<Box<dyn Stream<Item = PendingHint> + Send>>> {
        info!(
            sse_url = %self.sse_url,
            topics = topic_filter.len(),
            "Subscribing to MEV-Share pending transactions"
        );

        struct State {
            client: reqwest::Client,
            sse_url: String,
            topics: HashSet<B256>,
            backoff: Duration,
            /// Undelivered hints from the current chunk buffer
            pending: Vec<PendingHint>,
            /// Partial line carried across chunks
            buffer: String,
            body: Option<Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>>,
        }

        let state = State {
            client: self.client.clone(),
            sse_url: self.sse_url.clone(),
            topics: topic_filter,
            backoff: BACKOFF_INITIAL,
            pending: Vec::new(),
            buffer: String::new(),
            body: None,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(hint) = state.pending.pop() {
                    return Some((hint, state));
                }

                if state.body.is_none() {
                    let request = state
                        .client
                        .get(&state.sse_url)
                        .header("Accept", "text/event-stream")
                        .send()
                        .await
                        .and_then(|r| r.error_for_status());

                    match request {
                        Ok(response) => {
                            state.backoff = BACKOFF_INITIAL;
                            state.buffer.clear();
                            state.body =
                                Some(Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec()))));
                            debug!("MEV-Share stream connected");
                        }
                        Err(e) => {
                            warn!(error = %e, backoff = ?state.backoff, "MEV-Share connect failed, retrying");
                            tokio::time::sleep(state.backoff).await;
                            state.backoff = (state.backoff * 2).min(BACKOFF_MAX);
                            continue;
                        }
                    }
                }

                let chunk = state.body.as_mut().unwrap().next().await;
                match chunk {
                    Some(Ok(bytes)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        let mut hints = Vec::new();
                        while let Some(newline) = state.buffer.find('\n') {
                            let line: String = state.buffer.drain(..=newline).collect();
                            if let Some(hint) = parse_sse_line(line.trim(), &state.topics) {
                                hints.push(hint);
                            }
                        }
                        // Reverse so pop() delivers in arrival order.
                        hints.reverse();
                        state.pending = hints;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "MEV-Share stream error, reconnecting");
                        state.body = None;
                    }
                    None => {
                        warn!("MEV-Share stream closed, reconnecting");
                        state.body = None;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Parse one SSE line; returns a hint only if a revealed log matches.
fn parse_sse_line(line: &str, topics: &HashSet<B256>) -> Option<PendingHint> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[]" {
        return None;
    }

    let hint: PendingHint = match serde_json::from_str(payload) {
        Ok(hint) => hint,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable MEV-Share payload");
            return None;
        }
    };

    if hint.matching_logs(topics).next().is_some() {
        Some(hint)
    } else {
        None
    }
}
