//! WebSocket subscriptions for new heads and filtered logs.
//!
//! Streams reconnect themselves: a read that idles past the watchdog, or a
//! dropped connection, tears the subscription down and dials again with
//! exponential backoff (1s doubling, 60s cap). The provider handle lives in
//! the stream state so the socket stays open for the stream's lifetime.

use std::pin::Pin;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use anyhow::Result;
use futures::stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Initial reconnect backoff.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A new chain head.
#[derive(Debug, Clone)]
pub struct NewHead {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// WebSocket listener configuration for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Contract addresses to filter on (empty = all)
    pub addresses: Vec<Address>,
    /// Topic-0 hashes to filter on
    pub topics: Vec<B256>,
}

impl SubscriptionSpec {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new().event_signature(self.topics.clone());
        if !self.addresses.is_empty() {
            filter = filter.address(self.addresses.clone());
        }
        filter
    }
}

/// WebSocket event listener.
pub struct EventListener {
    ws_url: String,
    /// Read-idle watchdog; a subscription silent for this long reconnects.
    idle_timeout: Duration,
}

impl EventListener {
    pub fn new(ws_url: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            ws_url: ws_url.into(),
            idle_timeout,
        }
    }

    /// Subscribe to filtered logs. The returned stream reconnects on idle
    /// or disconnect and only ends when the consumer drops it.
    pub async fn subscribe_logs(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<Pin<Box<dyn Stream<Item = Log> + Send>>> {
        info!(
            ws_url = %self.ws_url,
            addresses = spec.addresses.len(),
            topics = spec.topics.len(),
            "Subscribing to filtered logs"
        );

        let ws_url = self.ws_url.clone();
        let idle = self.idle_timeout;

        type LogConn = (alloy::providers::RootProvider, Pin<Box<dyn Stream<Item = Log> + Send>>);

        struct State {
            ws_url: String,
            spec: SubscriptionSpec,
            idle: Duration,
            backoff: Duration,
            conn: Option<LogConn>,
        }

        let state = State {
            ws_url,
            spec,
            idle,
            backoff: BACKOFF_INITIAL,
            conn: None,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.conn.is_none() {
                    match connect_logs(&state.ws_url, &state.spec).await {
                        Ok(conn) => {
                            state.backoff = BACKOFF_INITIAL;
                            state.conn = Some(conn);
                        }
                        Err(e) => {
                            warn!(error = %e, backoff = ?state.backoff, "Log subscription failed, retrying");
                            tokio::time::sleep(state.backoff).await;
                            state.backoff = (state.backoff * 2).min(BACKOFF_MAX);
                            continue;
                        }
                    }
                }

                let conn = state.conn.as_mut().unwrap();
                match tokio::time::timeout(state.idle, conn.1.next()).await {
                    Ok(Some(log)) => return Some((log, state)),
                    Ok(None) => {
                        warn!("Log subscription closed, reconnecting");
                        state.conn = None;
                    }
                    Err(_) => {
                        warn!(idle = ?state.idle, "Log subscription idle past watchdog, reconnecting");
                        state.conn = None;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    /// Subscribe to new block headers with the same reconnect behavior.
    pub async fn subscribe_new_heads(&self) -> Result<Pin<Box<dyn Stream<Item = NewHead> + Send>>> {
        info!(ws_url = %self.ws_url, "Subscribing to new block headers");

        let ws_url = self.ws_url.clone();
        let idle = self.idle_timeout;

        type HeadConn = (alloy::providers::RootProvider, Pin<Box<dyn Stream<Item = NewHead> + Send>>);

        struct State {
            ws_url: String,
            idle: Duration,
            backoff: Duration,
            conn: Option<HeadConn>,
        }

        let state = State {
            ws_url,
            idle,
            backoff: BACKOFF_INITIAL,
            conn: None,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.conn.is_none() {
                    match connect_heads(&state.ws_url).await {
                        Ok(conn) => {
                            state.backoff = BACKOFF_INITIAL;
                            state.conn = Some(conn);
                        }
                        Err(e) => {
                            warn!(error = %e, backoff = ?state.backoff, "Head subscription failed, retrying");
                            tokio::time::sleep(state.backoff).await;
                            state.backoff = (state.backoff * 2).min(BACKOFF_MAX);
                            continue;
                        }
                    }
                }

                let conn = state.conn.as_mut().unwrap();
                match tokio::time::timeout(state.idle, conn.1.next()).await {
                    Ok(Some(head)) => return Some((head, state)),
                    Ok(None) => {
                        warn!("Head subscription closed, reconnecting");
                        state.conn = None;
                    }
                    Err(_) => {
                        warn!(idle = ?state.idle, "Head subscription idle past watchdog, reconnecting");
                        state.conn = None;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

async fn connect_logs(
    ws_url: &str,
    spec: &SubscriptionSpec,
) -> Result<(
    alloy::providers::RootProvider,
    Pin<Box<dyn Stream<Item = Log> + Send>>,
)> {
    let ws = WsConnect::new(ws_url);
    let provider = ProviderBuilder::new().on_ws(ws).await?;
    debug!("WebSocket connected for log subscription");

    let sub = provider.subscribe_logs(&spec.filter()).await?;
    let stream: Pin<Box<dyn Stream<Item = Log> + Send>> = Box::pin(sub.into_stream());
    Ok((provider.root().clone(), stream))
}

async fn connect_heads(
    ws_url: &str,
) -> Result<(
    alloy::providers::RootProvider,
    Pin<Box<dyn Stream<Item = NewHead> + Send>>,
)> {
    let ws = WsConnect::new(ws_url);
    let provider = ProviderBuilder::new().on_ws(ws).await?;
    debug!("WebSocket connected for head subscription");

    let sub = provider.subscribe_blocks().await?;
    let stream: Pin<Box<dyn Stream<Item = NewHead> + Send>> = Box::pin(sub.into_stream().map(|header| NewHead {
        number: header.number,
        hash: header.hash,
        parent_hash: header.parent_hash,
        timestamp: header.timestamp,
    }));
    Ok((provider.root().clone(), stream))
}
