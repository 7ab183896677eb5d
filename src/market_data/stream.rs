// =============================================================================
// Stream transport — sharded combined-stream WebSocket connections
// =============================================================================
//
// Four topics per pair (aggTrade, ticker, bookTicker, depth5) are packed onto
// combined-stream connections of at most 180 topics. Each connection pings
// every 20 s and, on any error, reconnects after 2 s with the same topic
// chunk, so a dropped socket never reshuffles subscriptions.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::config::{MAX_TOPICS_PER_CONNECTION, WS_PING_INTERVAL_SECS, WS_RECONNECT_DELAY_SECS};
use crate::market_data::events::{parse_event, MarketEvent};

const STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/stream?streams=";

/// The four stream topics subscribed per pair.
pub fn topics_for_pairs(symbols: &[String]) -> Vec<String> {
    let mut topics = Vec::with_capacity(symbols.len() * 4);
    for symbol in symbols {
        let lower = symbol.to_lowercase();
        topics.push(format!("{lower}@aggTrade"));
        topics.push(format!("{lower}@ticker"));
        topics.push(format!("{lower}@bookTicker"));
        topics.push(format!("{lower}@depth5@100ms"));
    }
    topics
}

/// Split topics into connection-sized chunks.
pub fn chunk_topics(topics: Vec<String>) -> Vec<Vec<String>> {
    topics
        .chunks(MAX_TOPICS_PER_CONNECTION)
        .map(|c| c.to_vec())
        .collect()
}

/// Spawn one reconnecting task per topic chunk.
pub fn spawn_transport(
    symbols: Vec<String>,
    tx: mpsc::Sender<MarketEvent>,
    shutdown: watch::Receiver<bool>,
) {
    let chunks = chunk_topics(topics_for_pairs(&symbols));
    info!(
        pairs = symbols.len(),
        connections = chunks.len(),
        "launching stream transport"
    );

    for (shard, chunk) in chunks.into_iter().enumerate() {
        let tx = tx.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = run_stream_chunk(&chunk, &tx) => match result {
                        Ok(()) => warn!(shard, "stream connection ended"),
                        Err(e) => error!(shard, error = %e, "stream connection error"),
                    },
                    _ = shutdown.changed() => break,
                }
                tokio::time::sleep(Duration::from_secs(WS_RECONNECT_DELAY_SECS)).await;
            }
            info!(shard, "stream shard stopped");
        });
    }
}

/// Run one combined-stream connection until it drops.
async fn run_stream_chunk(topics: &[String], tx: &mpsc::Sender<MarketEvent>) -> Result<()> {
    let url = format!("{}{}", STREAM_BASE_URL, topics.join("/"));
    info!(topics = topics.len(), "connecting to stream WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to stream WebSocket")?;
    info!(topics = topics.len(), "stream WebSocket connected");

    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    // Malformed frames and unknown streams drop here.
                    if let Some(event) = parse_event(&text) {
                        if tx.send(event).await.is_err() {
                            // Dispatch stage is gone — stop cleanly.
                            return Ok(());
                        }
                    }
                }
                // Control frames are handled by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
            _ = ping.tick() => {
                write
                    .send(Message::Ping(Vec::new()))
                    .await
                    .context("stream ping failed")?;
            }
        }
    }
}
