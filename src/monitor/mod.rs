// =============================================================================
// Symbol monitor — per-pair streaming feature engine
// =============================================================================
//
// One monitor owns all mutable state for a single pair. It is only ever
// touched by the dispatch stage: event handlers run as frames arrive, the
// periodic computation and the gate run on the 250 ms tick. Nothing here is
// shared or locked.
//
// Every estimator is incremental — no handler or tick reprocesses history
// beyond its own bounded ring.
// =============================================================================

mod gate;
mod periodic;

use crate::config::{Tier, AGG_TRADE_BUFFER_SIZE};
use crate::ring_buffer::RingBuffer;

/// Division guard for ratio denominators.
pub(crate) const EPS: f64 = 1e-9;

/// Ring capacities for the monitor's bounded histories.
const RETURN_HISTORY_CAPACITY: usize = 300;
const SPREAD_HISTORY_CAPACITY: usize = 60;
const TRADE_IMBALANCE_CAPACITY: usize = 60;
const IMBALANCE_HISTORY_CAPACITY: usize = 20;
const ACCEL_HISTORY_CAPACITY: usize = 60;
const SLOPE_HISTORY_CAPACITY: usize = 40;
const RSI_PRICE_CAPACITY: usize = 20;
/// 100 ms buckets covering a 3 s window — comfortably past the 2.5 s lookback.
const PRICE_BUCKET_CAPACITY: usize = 30;

/// One aggregated trade as kept in the per-pair ring.
#[derive(Debug, Clone, Copy)]
pub struct AggTrade {
    pub price: f64,
    pub qty: f64,
    pub event_time_ms: i64,
    pub buyer_is_maker: bool,
}

/// A log return stamped with the tick that sampled it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimedReturn {
    pub at_ms: i64,
    pub log_return: f64,
}

/// One 100 ms price bucket.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PriceBucket {
    pub ts_ms: i64,
    pub price: f64,
}

/// Per-pair state machine of streaming estimators and the signal gate.
pub struct SymbolMonitor {
    pub(crate) symbol: String,
    pub(crate) tier: Tier,
    pub(crate) exchange: String,

    // -- 24 h ticker context --------------------------------------------------
    pub(crate) ticker_24h_volume_usdt: f64,
    pub(crate) ticker_24h_change_pct: f64,
    pub(crate) ticker_24h_high: f64,
    pub(crate) ticker_24h_low: f64,

    // -- top of book ----------------------------------------------------------
    pub(crate) best_bid: f64,
    pub(crate) best_ask: f64,
    pub(crate) mid: f64,

    // -- trades ---------------------------------------------------------------
    pub(crate) agg_trades: RingBuffer<AggTrade>,
    pub(crate) last_price: f64,
    pub(crate) effective_spread_history: RingBuffer<f64>,
    pub(crate) effective_spread_bps_mean: f64,
    pub(crate) trade_imbalance_history: RingBuffer<f64>,

    // -- top-5 depth ----------------------------------------------------------
    pub(crate) depth5_bid_volume: f64,
    pub(crate) depth5_ask_volume: f64,
    pub(crate) depth5_total_volume: f64,
    pub(crate) depth5_volume_ratio: f64,
    pub(crate) depth5_ob_imbalance: f64,
    pub(crate) imbalance_history: RingBuffer<f64>,
    pub(crate) imbalance_ma5: f64,
    pub(crate) imbalance_ma20: f64,
    pub(crate) imbalance_velocity: f64,
    pub(crate) imbalance_volatility: f64,

    // -- realised volatility --------------------------------------------------
    pub(crate) return_history: RingBuffer<TimedReturn>,
    pub(crate) last_return_sample_ms: i64,
    pub(crate) return_ref_price: f64,
    pub(crate) volatility_30s: f64,
    pub(crate) volatility_5m: f64,
    pub(crate) volatility_ratio: f64,

    // -- 1 s trade aggregation (recomputed each tick) -------------------------
    pub(crate) vol_1s: f64,
    pub(crate) trade_count_1s: u64,
    pub(crate) taker_buy_1s: f64,
    pub(crate) taker_sell_1s: f64,

    // -- volume EWMAs ---------------------------------------------------------
    pub(crate) ewma_fast: f64,
    pub(crate) ewma_1m: f64,
    pub(crate) ewma_5m: f64,
    pub(crate) ewma_seeded: bool,
    pub(crate) volume_accel: f64,

    // -- rolling price buckets ------------------------------------------------
    pub(crate) price_buckets: RingBuffer<PriceBucket>,

    // -- EMA stack ------------------------------------------------------------
    pub(crate) ema9: f64,
    pub(crate) ema21: f64,
    pub(crate) ema50: f64,
    pub(crate) ema_seeded: bool,
    pub(crate) ema_stacked_bullish: bool,
    pub(crate) ema_stacked_bearish: bool,
    pub(crate) ema_alignment_strength: f64,
    pub(crate) price_above_ema9: bool,

    // -- RSI(9), Wilder smoothing --------------------------------------------
    pub(crate) rsi_price_history: RingBuffer<f64>,
    pub(crate) rsi_avg_gain: f64,
    pub(crate) rsi_avg_loss: f64,
    pub(crate) rsi_seeded: bool,
    pub(crate) rsi9: f64,

    // -- PPO (fast 3, slow 10, signal 16) -------------------------------------
    pub(crate) ppo_ema_fast: f64,
    pub(crate) ppo_ema_slow: f64,
    pub(crate) ppo_price_seeded: bool,
    pub(crate) ppo_line: f64,
    pub(crate) ppo_signal_line: f64,
    pub(crate) ppo_signal_seeded: bool,
    pub(crate) ppo_histogram: f64,

    // -- taker flow -----------------------------------------------------------
    pub(crate) taker_flow_imbalance: f64,
    pub(crate) taker_flow_magnitude: f64,
    pub(crate) taker_flow_ratio: f64,
    pub(crate) taker_ratio_smoothed: f64,
    pub(crate) taker_ratio_seeded: bool,

    // -- volume acceleration --------------------------------------------------
    pub(crate) volume_accel_history: RingBuffer<f64>,
    pub(crate) accel_sigma: f64,

    // -- price slope ----------------------------------------------------------
    pub(crate) price_slope: f64,
    pub(crate) price_slope_seeded: bool,
    pub(crate) price_slope_history: RingBuffer<f64>,
    pub(crate) price_slope_sigma: f64,

    // -- gate bookkeeping -----------------------------------------------------
    pub(crate) last_signal_trigger_ms: i64,
    pub(crate) time_cache: gate::TimeCache,
}

impl SymbolMonitor {
    pub fn new(symbol: impl Into<String>, tier: Tier, exchange: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            tier,
            exchange: exchange.into(),

            ticker_24h_volume_usdt: 0.0,
            ticker_24h_change_pct: 0.0,
            ticker_24h_high: 0.0,
            ticker_24h_low: 0.0,

            best_bid: 0.0,
            best_ask: 0.0,
            mid: 0.0,

            agg_trades: RingBuffer::new(AGG_TRADE_BUFFER_SIZE),
            last_price: 0.0,
            effective_spread_history: RingBuffer::new(SPREAD_HISTORY_CAPACITY),
            effective_spread_bps_mean: 0.0,
            trade_imbalance_history: RingBuffer::new(TRADE_IMBALANCE_CAPACITY),

            depth5_bid_volume: 0.0,
            depth5_ask_volume: 0.0,
            depth5_total_volume: 0.0,
            depth5_volume_ratio: 0.0,
            depth5_ob_imbalance: 0.0,
            imbalance_history: RingBuffer::new(IMBALANCE_HISTORY_CAPACITY),
            imbalance_ma5: 0.0,
            imbalance_ma20: 0.0,
            imbalance_velocity: 0.0,
            imbalance_volatility: 0.0,

            return_history: RingBuffer::new(RETURN_HISTORY_CAPACITY),
            last_return_sample_ms: 0,
            return_ref_price: 0.0,
            volatility_30s: 0.0,
            volatility_5m: 0.0,
            volatility_ratio: 1.0,

            vol_1s: 0.0,
            trade_count_1s: 0,
            taker_buy_1s: 0.0,
            taker_sell_1s: 0.0,

            ewma_fast: 0.0,
            ewma_1m: 0.0,
            ewma_5m: 0.0,
            ewma_seeded: false,
            volume_accel: 0.0,

            price_buckets: RingBuffer::new(PRICE_BUCKET_CAPACITY),

            ema9: 0.0,
            ema21: 0.0,
            ema50: 0.0,
            ema_seeded: false,
            ema_stacked_bullish: false,
            ema_stacked_bearish: false,
            ema_alignment_strength: 0.0,
            price_above_ema9: false,

            rsi_price_history: RingBuffer::new(RSI_PRICE_CAPACITY),
            rsi_avg_gain: 0.0,
            rsi_avg_loss: 0.0,
            rsi_seeded: false,
            rsi9: 50.0,

            ppo_ema_fast: 0.0,
            ppo_ema_slow: 0.0,
            ppo_price_seeded: false,
            ppo_line: 0.0,
            ppo_signal_line: 0.0,
            ppo_signal_seeded: false,
            ppo_histogram: 0.0,

            taker_flow_imbalance: 0.0,
            taker_flow_magnitude: 0.0,
            taker_flow_ratio: 0.0,
            taker_ratio_smoothed: 0.0,
            taker_ratio_seeded: false,

            volume_accel_history: RingBuffer::new(ACCEL_HISTORY_CAPACITY),
            accel_sigma: 0.0,

            price_slope: 0.0,
            price_slope_seeded: false,
            price_slope_history: RingBuffer::new(SLOPE_HISTORY_CAPACITY),
            price_slope_sigma: 0.0,

            last_signal_trigger_ms: i64::MIN / 2,
            time_cache: gate::TimeCache::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    // -------------------------------------------------------------------------
    // Event handlers
    // -------------------------------------------------------------------------

    /// Record the rolling 24 h ticker context.
    pub fn apply_ticker(
        &mut self,
        quote_volume_24h: f64,
        change_pct_24h: f64,
        high_24h: f64,
        low_24h: f64,
        last: f64,
    ) {
        self.ticker_24h_volume_usdt = quote_volume_24h;
        self.ticker_24h_change_pct = change_pct_24h;
        self.ticker_24h_high = high_24h;
        self.ticker_24h_low = low_24h;
        if last > 0.0 {
            self.last_price = last;
        }
    }

    /// Update the top of book; the mid is only refreshed when both sides are
    /// finite and positive.
    pub fn apply_book_ticker(&mut self, best_bid: f64, best_ask: f64) {
        if best_bid.is_finite() && best_bid > 0.0 {
            self.best_bid = best_bid;
        }
        if best_ask.is_finite() && best_ask > 0.0 {
            self.best_ask = best_ask;
        }
        if self.best_bid > 0.0 && self.best_ask > 0.0 {
            self.mid = (self.best_bid + self.best_ask) / 2.0;
        }
    }

    /// Push a trade into the ring and fold it into the effective-spread and
    /// trade-imbalance histories.
    pub fn add_agg_trade(&mut self, trade: AggTrade) {
        self.last_price = trade.price;

        if self.mid > 0.0 {
            let effective_bps = (trade.price - self.mid).abs() / self.mid * 10_000.0;
            self.effective_spread_history.push(effective_bps);
            self.effective_spread_bps_mean = mean(self.effective_spread_history.iter());
        }

        // Taker buys count positive, taker sells negative.
        let signed = if trade.buyer_is_maker {
            -trade.qty
        } else {
            trade.qty
        };
        self.trade_imbalance_history.push(signed);

        self.agg_trades.push(trade);
    }

    /// Fold a top-5 depth snapshot into the depth aggregates and the
    /// imbalance history block.
    pub fn update_depth_snapshot(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        let bid_volume: f64 = bids.iter().take(5).map(|(_, q)| q).sum();
        let ask_volume: f64 = asks.iter().take(5).map(|(_, q)| q).sum();

        self.depth5_bid_volume = bid_volume;
        self.depth5_ask_volume = ask_volume;
        self.depth5_total_volume = bid_volume + ask_volume;
        self.depth5_volume_ratio = bid_volume / (ask_volume + EPS);

        let previous = self.depth5_ob_imbalance;
        let imbalance = (bid_volume - ask_volume) / (bid_volume + ask_volume + EPS);
        self.depth5_ob_imbalance = imbalance;

        self.imbalance_history.push(imbalance);
        let n = self.imbalance_history.len();
        self.imbalance_ma5 = mean(self.imbalance_history.iter().skip(n.saturating_sub(5)));
        self.imbalance_ma20 = mean(self.imbalance_history.iter());
        self.imbalance_velocity = imbalance - previous;
        self.imbalance_volatility =
            sample_stddev(self.imbalance_history.iter().skip(n.saturating_sub(10)));
    }
}

// -----------------------------------------------------------------------------
// Streaming stats helpers
// -----------------------------------------------------------------------------

pub(crate) fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Sample standard deviation (n − 1 denominator); 0 under two points.
pub(crate) fn sample_stddev<'a>(values: impl Iterator<Item = &'a f64> + Clone) -> f64 {
    let m = mean(values.clone());
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for v in values {
        sum_sq += (v - m) * (v - m);
        n += 1;
    }
    if n < 2 {
        0.0
    } else {
        (sum_sq / (n - 1) as f64).sqrt()
    }
}

/// Population standard deviation (n denominator); 0 when empty.
pub(crate) fn population_stddev<'a>(values: impl Iterator<Item = &'a f64> + Clone) -> f64 {
    let m = mean(values.clone());
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for v in values {
        sum_sq += (v - m) * (v - m);
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        (sum_sq / n as f64).sqrt()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SymbolMonitor {
        SymbolMonitor::new("BTCUSDT", Tier::Mid, "binance")
    }

    #[test]
    fn book_ticker_keeps_last_valid_sides() {
        let mut m = monitor();
        m.apply_book_ticker(100.0, 100.2);
        assert!((m.mid - 100.1).abs() < 1e-9);

        // A zero side is ignored; the mid keeps the last valid pair.
        m.apply_book_ticker(0.0, 100.4);
        assert!((m.best_bid - 100.0).abs() < 1e-9);
        assert!((m.best_ask - 100.4).abs() < 1e-9);
        assert!((m.mid - 100.2).abs() < 1e-9);

        m.apply_book_ticker(f64::NAN, f64::INFINITY);
        assert!((m.best_bid - 100.0).abs() < 1e-9);
        assert!((m.best_ask - 100.4).abs() < 1e-9);
    }

    #[test]
    fn agg_trade_updates_spread_and_imbalance() {
        let mut m = monitor();
        m.apply_book_ticker(99.99, 100.01);

        m.add_agg_trade(AggTrade {
            price: 100.01,
            qty: 2.0,
            event_time_ms: 1_000,
            buyer_is_maker: false,
        });
        m.add_agg_trade(AggTrade {
            price: 99.99,
            qty: 1.0,
            event_time_ms: 1_001,
            buyer_is_maker: true,
        });

        assert_eq!(m.agg_trades.len(), 2);
        assert!((m.last_price - 99.99).abs() < 1e-9);
        // |price − mid| / mid × 10⁴ = 1 bps either side.
        assert!((m.effective_spread_bps_mean - 1.0).abs() < 1e-6);
        assert_eq!(m.trade_imbalance_history.to_vec(), vec![2.0, -1.0]);
    }

    #[test]
    fn agg_trade_without_mid_skips_spread_history() {
        let mut m = monitor();
        m.add_agg_trade(AggTrade {
            price: 100.0,
            qty: 1.0,
            event_time_ms: 1_000,
            buyer_is_maker: false,
        });
        assert!(m.effective_spread_history.is_empty());
        assert_eq!(m.agg_trades.len(), 1);
    }

    #[test]
    fn depth_snapshot_aggregates() {
        let mut m = monitor();
        let bids = vec![(100.0, 3.0), (99.9, 2.0), (99.8, 1.0), (99.7, 1.0), (99.6, 1.0)];
        let asks = vec![(100.1, 1.0), (100.2, 1.0), (100.3, 1.0), (100.4, 0.5), (100.5, 0.5)];
        m.update_depth_snapshot(&bids, &asks);

        assert!((m.depth5_bid_volume - 8.0).abs() < 1e-9);
        assert!((m.depth5_ask_volume - 4.0).abs() < 1e-9);
        assert!((m.depth5_total_volume - 12.0).abs() < 1e-9);
        assert!((m.depth5_volume_ratio - 2.0).abs() < 1e-6);
        assert!((m.depth5_ob_imbalance - (4.0 / 12.0)).abs() < 1e-6);
        assert_eq!(m.imbalance_history.len(), 1);
        assert!((m.imbalance_ma5 - m.depth5_ob_imbalance).abs() < 1e-12);
    }

    #[test]
    fn imbalance_velocity_tracks_consecutive_snapshots() {
        let mut m = monitor();
        m.update_depth_snapshot(&[(100.0, 6.0)], &[(100.1, 2.0)]); // imbalance 0.5
        let first = m.depth5_ob_imbalance;
        m.update_depth_snapshot(&[(100.0, 2.0)], &[(100.1, 6.0)]); // imbalance -0.5
        assert!((m.imbalance_velocity - (m.depth5_ob_imbalance - first)).abs() < 1e-12);
        assert!(m.imbalance_volatility > 0.0);
    }

    #[test]
    fn stats_helpers() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(xs.iter()) - 5.0).abs() < 1e-12);
        assert!((population_stddev(xs.iter()) - 2.0).abs() < 1e-12);
        assert!(sample_stddev(xs.iter()) > population_stddev(xs.iter()));
        let empty: [f64; 0] = [];
        assert_eq!(mean(empty.iter()), 0.0);
        assert_eq!(sample_stddev([1.0].iter()), 0.0);
    }
}
