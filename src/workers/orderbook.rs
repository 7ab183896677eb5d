// =============================================================================
// Orderbook worker — depth snapshots at fixed offsets after a signal
// =============================================================================
//
// Each task captures one depth-5 snapshot and appends its liquidity features
// to the signal's orderbook document. Offsets are independent: a failed REST
// fetch skips this snapshot only.
// =============================================================================

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exchange::client::{DepthClient, DepthLevels};
use crate::monitor::EPS;
use crate::store::DocumentStore;

/// Payload of a `<exchange>_orderbook` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookTask {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "tOffset")]
    pub t_offset: i64,
}

/// One captured depth-5 snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookSnapshot {
    pub t_offset_sec: i64,
    pub ts_ms: i64,
    pub bid_sum: f64,
    pub ask_sum: f64,
    pub imbalance: f64,
    pub bid_sum_usdt: f64,
    pub ask_sum_usdt: f64,
    pub total_liquidity_usdt: f64,
    pub imbalance_usdt: f64,
    pub mid_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_bps: f64,
}

/// The per-signal orderbook document (snapshots appended per offset).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookDoc {
    pub signal_id: String,
    pub symbol: String,
    pub snapshots: Vec<OrderbookSnapshot>,
}

/// Process one orderbook task: fetch, featurise, append.
pub async fn handle(
    depth: &DepthClient,
    docs: &dyn DocumentStore,
    task: OrderbookTask,
    now_ms: i64,
) -> Result<()> {
    let levels = match depth.get_depth5(&task.symbol).await {
        Ok(levels) => levels,
        Err(e) => {
            warn!(
                signal_id = %task.id,
                symbol = %task.symbol,
                offset_sec = task.t_offset,
                error = %e,
                "depth snapshot fetch failed — offset skipped"
            );
            return Ok(());
        }
    };

    let snapshot = compute_snapshot(task.t_offset, now_ms, &levels);
    docs.upsert_orderbook(&task.id, &task.symbol, snapshot).await?;
    info!(
        signal_id = %task.id,
        symbol = %task.symbol,
        offset_sec = task.t_offset,
        "orderbook snapshot appended"
    );
    Ok(())
}

/// Liquidity features of a depth-5 snapshot.
pub fn compute_snapshot(t_offset_sec: i64, ts_ms: i64, levels: &DepthLevels) -> OrderbookSnapshot {
    let bid_sum: f64 = levels.bids.iter().take(5).map(|(_, q)| q).sum();
    let ask_sum: f64 = levels.asks.iter().take(5).map(|(_, q)| q).sum();

    let best_bid = levels.bids.first().map(|(p, _)| *p).unwrap_or(0.0);
    let best_ask = levels.asks.first().map(|(p, _)| *p).unwrap_or(0.0);
    let mid_price = (best_bid + best_ask) / 2.0;

    let imbalance = (bid_sum - ask_sum) / (bid_sum + ask_sum + EPS);
    let bid_sum_usdt = bid_sum * mid_price;
    let ask_sum_usdt = ask_sum * mid_price;
    let total_liquidity_usdt = bid_sum_usdt + ask_sum_usdt;
    let imbalance_usdt = (bid_sum_usdt - ask_sum_usdt) / (total_liquidity_usdt + EPS);

    let spread_bps = if best_ask > 0.0 {
        (best_ask - best_bid) / best_ask * 10_000.0
    } else {
        0.0
    };

    OrderbookSnapshot {
        t_offset_sec,
        ts_ms,
        bid_sum,
        ask_sum,
        imbalance,
        bid_sum_usdt,
        ask_sum_usdt,
        total_liquidity_usdt,
        imbalance_usdt,
        mid_price,
        best_bid,
        best_ask,
        spread_bps,
    }
}
