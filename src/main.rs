// =============================================================================
// Surge Sentinel — Main Entry Point
// =============================================================================
//
// Real-time microstructure signal detector: subscribes to trade, ticker,
// book-ticker and depth streams for the configured pair universe, runs the
// per-symbol feature engine on a 250 ms tick, and schedules delayed
// follow-up captures for every emitted signal.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod dispatch;
mod exchange;
mod followup;
mod market_data;
mod monitor;
mod ring_buffer;
mod signal;
mod store;
mod tape;
mod workers;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::dispatch::Dispatcher;
use crate::exchange::client::DepthClient;
use crate::followup::FollowupDispatcher;
use crate::store::redis::RedisStore;
use crate::tape::PriceTape;
use crate::workers::queue::WorkerContext;

/// Transport → dispatch stage channel depth.
const EVENT_CHANNEL_CAPACITY: usize = 8_192;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Surge Sentinel — starting up");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(url) = std::env::var("SENTINEL_REDIS_URL") {
        config.redis_url = url;
    }

    // An empty universe means nothing to monitor: refuse to start.
    if config.pairs.is_empty() {
        anyhow::bail!("pair universe is empty — check runtime_config.json");
    }

    info!(
        pairs = config.pairs.len(),
        exchange = %config.exchange,
        "configured pair universe"
    );

    // ── 2. Stores ────────────────────────────────────────────────────────
    let store = Arc::new(RedisStore::connect(&config.redis_url, &config.exchange).await?);
    let tape = Arc::new(PriceTape::new(store.clone()));

    // ── 3. Transport ─────────────────────────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let symbols: Vec<String> = config
        .pairs
        .iter()
        .map(|p| p.symbol.to_uppercase())
        .collect();
    market_data::stream::spawn_transport(symbols, event_tx, shutdown_rx.clone());

    // ── 4. Dispatch stage ────────────────────────────────────────────────
    let followups = FollowupDispatcher::new(
        config.exchange.clone(),
        store.clone() as Arc<dyn store::SignalSink>,
        store.clone() as Arc<dyn store::TaskScheduler>,
    );
    let dispatcher = Dispatcher::new(&config.pairs, &config.exchange, tape.clone(), followups);
    let stage = tokio::spawn(dispatcher.run(event_rx, shutdown_rx.clone()));

    // ── 5. Follow-up workers ─────────────────────────────────────────────
    let depth = Arc::new(DepthClient::new());
    for queue in [
        format!("{}_order", config.exchange),
        format!("{}_price", config.exchange),
    ] {
        let ctx = WorkerContext {
            exchange: config.exchange.clone(),
            scheduler: store.clone(),
            docs: store.clone(),
            tape: store.clone(),
            depth: depth.clone(),
        };
        tokio::spawn(workers::queue::run_queue_worker(ctx, queue, shutdown_rx.clone()));
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    // The stage flushes the tape before returning.
    let _ = stage.await;

    if let Err(e) = config.save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Surge Sentinel shut down complete");
    Ok(())
}
