// =============================================================================
// Signal gate — the multi-stage filter evaluated after each periodic pass
// =============================================================================
//
// Guards run cheapest-first and early-return, so a quiet symbol costs a few
// comparisons per tick. A passing gate arms the cooldown and freezes the
// monitor's current feature set into a SignalVector.
// =============================================================================

use chrono::{Datelike, Timelike};

use crate::config::{
    EXPECTED_TRADE_SIZE_USDT, MAX_BID_ASK_SPREAD_PCT, MIN_EXECUTION_MULTIPLIER,
    MIN_TICKER_24H_VOLUME_USDT, MIN_TRADES_IN_1S, MIN_VOLUME_SPIKE_RATIO_1M5M,
    PRICE_LOOKBACK_WINDOW_MS, PRICE_SLOPE_ZSCORE, SECONDS_PER_YEAR, SIGNAL_COOLDOWN_MS,
    TIME_CACHE_DURATION_MS, VOLUME_ACCEL_ZSCORE,
};
use crate::signal::{normalize_symbol, SignalVector};

use super::SymbolMonitor;

/// Minimum annualised 5-minute volatility — below this the pair is dormant.
const MIN_VOLATILITY_5M: f64 = 0.05;
/// Cap on the volatility-normalised spread.
const MAX_NORMALIZED_SPREAD: f64 = 3.0;
/// Minimum volatility-normalised price move over the lookback window.
const MIN_PRICE_ZSCORE: f64 = 1.5;
/// Share of the pair's average per-second dollar flow used as a volume floor.
const DAILY_FLOW_FLOOR_FRACTION: f64 = 0.25;

/// Cached UTC session fields, refreshed at most once per minute.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimeCache {
    cached_at_ms: i64,
    pub hour: u32,
    pub day_of_week: u32,
    pub weekend: bool,
}

impl TimeCache {
    pub(crate) fn refresh(&mut self, now_ms: i64) {
        if self.cached_at_ms != 0 && now_ms - self.cached_at_ms < TIME_CACHE_DURATION_MS {
            return;
        }
        let Some(dt) = chrono::DateTime::from_timestamp_millis(now_ms) else {
            return;
        };
        self.hour = dt.hour();
        self.day_of_week = dt.weekday().num_days_from_sunday();
        self.weekend = self.day_of_week == 0 || self.day_of_week == 6;
        self.cached_at_ms = now_ms;
    }
}

impl SymbolMonitor {
    /// Evaluate the full gate at `now_ms`.
    ///
    /// Returns the frozen feature vector on pass and arms the cooldown;
    /// returns `None` as soon as any guard fails.
    pub fn check_signal(&mut self, now_ms: i64) -> Option<SignalVector> {
        // 1. warm-up: a price and a volume baseline must exist.
        if self.last_price <= 0.0 || self.ewma_5m <= 0.0 {
            return None;
        }

        // 2. volatility estimators must be established.
        if self.return_history.len() < 30 || self.volatility_30s <= 0.0 {
            return None;
        }

        // 3. 24 h turnover floor.
        if self.ticker_24h_volume_usdt < MIN_TICKER_24H_VOLUME_USDT {
            return None;
        }

        // 4. executable liquidity on the thinner side, and real 1 s flow.
        let depth_floor_usdt = EXPECTED_TRADE_SIZE_USDT * MIN_EXECUTION_MULTIPLIER;
        let thinner_side = self.depth5_bid_volume.min(self.depth5_ask_volume);
        if thinner_side * self.mid < depth_floor_usdt {
            return None;
        }
        if self.vol_1s < EXPECTED_TRADE_SIZE_USDT {
            return None;
        }

        // 5. cooldown.
        if now_ms - self.last_signal_trigger_ms < SIGNAL_COOLDOWN_MS {
            return None;
        }

        // 6. tier volatility band.
        if self.volatility_5m > self.tier.volatility_cap() || self.volatility_5m < MIN_VOLATILITY_5M
        {
            return None;
        }

        // 7. valid quotes.
        if !self.best_bid.is_finite() || !self.best_ask.is_finite() {
            return None;
        }
        if !(self.best_ask > self.best_bid && self.best_bid > 0.0) {
            return None;
        }

        // 8. raw and volatility-normalised spread.
        let spread_pct = (self.best_ask - self.best_bid) / self.best_ask;
        if spread_pct > MAX_BID_ASK_SPREAD_PCT {
            return None;
        }
        let instant_vol = self.volatility_30s / SECONDS_PER_YEAR.sqrt();
        let normalized_spread = spread_pct / (instant_vol + 1e-4);
        if normalized_spread > MAX_NORMALIZED_SPREAD {
            return None;
        }

        // 9. volume spike against the dynamic threshold.
        self.time_cache.refresh(now_ms);
        let dyn_thresh = self.dynamic_volume_threshold(instant_vol);
        if self.ewma_1m <= 0.0 || self.ewma_fast / self.ewma_1m < dyn_thresh {
            return None;
        }
        if self.ewma_1m / self.ewma_5m < MIN_VOLUME_SPIKE_RATIO_1M5M {
            return None;
        }
        if self.accel_sigma <= 0.0 || self.volume_accel / self.accel_sigma < VOLUME_ACCEL_ZSCORE {
            return None;
        }
        let volume_floor = self.absolute_volume_floor();
        if self.vol_1s < volume_floor {
            return None;
        }
        if self.trade_count_1s < MIN_TRADES_IN_1S {
            return None;
        }

        // 10. upward price impulse over the lookback window.
        let price_then = self.bucket_price_at(now_ms - PRICE_LOOKBACK_WINDOW_MS)?;
        if price_then <= 0.0 || self.last_price <= price_then {
            return None;
        }
        if self.price_slope_sigma <= 0.0 {
            return None;
        }
        let slope_z = self.price_slope / self.price_slope_sigma;
        if slope_z < PRICE_SLOPE_ZSCORE {
            return None;
        }
        let price_change_pct = (self.last_price - price_then) / price_then;
        let price_z_score = price_change_pct / instant_vol;
        if price_z_score < MIN_PRICE_ZSCORE {
            return None;
        }

        self.last_signal_trigger_ms = now_ms;

        Some(self.build_vector(
            now_ms,
            spread_pct,
            normalized_spread,
            dyn_thresh,
            price_change_pct,
            slope_z,
            price_z_score,
        ))
    }

    /// Volume-spike threshold adapted to the volatility regime and session.
    fn dynamic_volume_threshold(&self, instant_vol: f64) -> f64 {
        let regime_modifier = if self.volatility_ratio > 1.5 {
            1.25
        } else if self.volatility_ratio < 0.8 {
            0.75
        } else {
            1.0
        };
        let vol_factor = 1.0 + instant_vol * 50.0 * regime_modifier;

        let session_factor = if self.time_cache.weekend {
            0.8
        } else if (13..=17).contains(&self.time_cache.hour) {
            1.5
        } else if self.time_cache.hour < 7 {
            0.75
        } else {
            1.0
        };

        (4.0 * vol_factor * session_factor).clamp(2.5, 20.0)
    }

    /// Tier floor or a quarter of the pair's average per-second dollar flow,
    /// whichever is larger.
    fn absolute_volume_floor(&self) -> f64 {
        let per_second_flow = self.ticker_24h_volume_usdt / 86_400.0;
        self.tier
            .volume_floor()
            .max(per_second_flow * DAILY_FLOW_FLOOR_FRACTION)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_vector(
        &self,
        now_ms: i64,
        spread_pct: f64,
        normalized_spread: f64,
        dyn_thresh: f64,
        price_change_pct: f64,
        slope_z: f64,
        price_z_score: f64,
    ) -> SignalVector {
        let created_at = chrono::DateTime::from_timestamp_millis(now_ms)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        SignalVector {
            exchange: self.exchange.clone(),
            created_at,
            symbol: normalize_symbol(&self.symbol),
            signal_timestamp_ms: now_ms,
            trigger_price: self.last_price,

            price_change_pct,
            price_slope: self.price_slope,
            slope_z,
            price_z_score,

            volume_ratio_fast_1m: self.ewma_fast / self.ewma_1m,
            volume_ratio_1m_5m: self.ewma_1m / self.ewma_5m,
            volume_accel_z: self.volume_accel / self.accel_sigma,
            current_1s_volume_usdt: self.vol_1s,
            volume_per_dollar: self.vol_1s / (self.ticker_24h_volume_usdt / 86_400.0),
            dyn_volume_thresh: dyn_thresh,

            volatility_30s: self.volatility_30s,
            volatility_5m: self.volatility_5m,
            volatility_ratio: self.volatility_ratio,

            spread_pct,
            spread_bps: spread_pct * 10_000.0,
            normalized_spread,
            effective_spread_bps: self.effective_spread_bps_mean,

            depth5_ob_imbalance: self.depth5_ob_imbalance,
            depth5_bid_volume: self.depth5_bid_volume,
            depth5_ask_volume: self.depth5_ask_volume,
            depth5_total_volume: self.depth5_total_volume,
            depth5_volume_ratio: self.depth5_volume_ratio,
            imbalance_ma5: self.imbalance_ma5,
            imbalance_ma20: self.imbalance_ma20,
            imbalance_velocity: self.imbalance_velocity,
            imbalance_volatility: self.imbalance_volatility,

            taker_ratio_smoothed: self.taker_ratio_smoothed,
            taker_buy_volume_abs: self.taker_buy_1s,
            taker_flow_imbalance: self.taker_flow_imbalance,
            taker_flow_magnitude: self.taker_flow_magnitude,
            taker_flow_ratio: self.taker_flow_ratio,

            ppo_histogram: self.ppo_histogram,
            ppo_line: self.ppo_line,
            signal_line: self.ppo_signal_line,
            rsi9: self.rsi9,

            ema9_over21: self.ema9 > self.ema21,
            ema21_over50: self.ema21 > self.ema50,
            ema_alignment_strength: self.ema_alignment_strength,
            ema_stacked_bullish: self.ema_stacked_bullish,
            ema_stacked_bearish: self.ema_stacked_bearish,
            ema_stacked_neutral: !self.ema_stacked_bullish && !self.ema_stacked_bearish,
            price_above_ema9: self.price_above_ema9,

            ticker_24hr_volume_usdt: self.ticker_24h_volume_usdt,
            ticker_24hr_price_change_pct: self.ticker_24h_change_pct,
            ticker_24hr_high: self.ticker_24h_high,
            ticker_24hr_low: self.ticker_24h_low,

            hour_of_day: self.time_cache.hour,
            day_of_week: self.time_cache.day_of_week,
            is_weekend: self.time_cache.weekend,
        }
    }

    /// Test scaffolding: drive every estimator into a state the gate accepts
    /// at `now_ms`. The cooldown clock is deliberately left untouched.
    #[cfg(test)]
    pub(crate) fn force_fireable(&mut self, now_ms: i64) {
        use crate::config::PRICE_BUCKET_DURATION_MS;
        use crate::ring_buffer::RingBuffer;

        use super::{PriceBucket, TimedReturn};

        self.last_price = 100.30;
        self.best_bid = 100.00;
        self.best_ask = 100.02;
        self.mid = 100.01;

        self.ticker_24h_volume_usdt = 5_000_000.0;
        self.ticker_24h_change_pct = 2.5;
        self.ticker_24h_high = 101.0;
        self.ticker_24h_low = 99.0;

        self.depth5_bid_volume = 40.0;
        self.depth5_ask_volume = 40.0;
        self.depth5_total_volume = 80.0;
        self.depth5_volume_ratio = 1.0;
        self.depth5_ob_imbalance = 0.0;

        // Alternating ±1.4246e-4 log returns ⇒ ≈ 0.8 annualised.
        self.return_history = RingBuffer::new(super::RETURN_HISTORY_CAPACITY);
        for i in 0..30_i64 {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            self.return_history.push(TimedReturn {
                at_ms: now_ms - 29_000 + i * 1_000,
                log_return: sign * 1.4246e-4,
            });
        }
        self.last_return_sample_ms = now_ms - 500;
        self.return_ref_price = self.last_price;
        self.volatility_30s = 0.8;
        self.volatility_5m = 0.6;
        self.volatility_ratio = self.volatility_30s / self.volatility_5m;

        self.vol_1s = 2_000.0;
        self.trade_count_1s = 30;
        self.taker_buy_1s = 2_000.0;
        self.taker_sell_1s = 0.0;
        self.taker_flow_imbalance = 1.0;
        self.taker_flow_magnitude = 2_000.0;
        self.taker_flow_ratio = 100.0;
        self.taker_ratio_smoothed = 80.0;
        self.taker_ratio_seeded = true;

        self.ewma_fast = 5_000.0;
        self.ewma_1m = 400.0;
        self.ewma_5m = 200.0;
        self.ewma_seeded = true;
        self.volume_accel = 50.0;
        self.accel_sigma = 10.0;

        self.price_buckets = RingBuffer::new(super::PRICE_BUCKET_CAPACITY);
        let then_floor = (now_ms - PRICE_LOOKBACK_WINDOW_MS).div_euclid(PRICE_BUCKET_DURATION_MS)
            * PRICE_BUCKET_DURATION_MS;
        let now_floor = now_ms.div_euclid(PRICE_BUCKET_DURATION_MS) * PRICE_BUCKET_DURATION_MS;
        self.price_buckets.push(PriceBucket {
            ts_ms: then_floor,
            price: 100.00,
        });
        self.price_buckets.push(PriceBucket {
            ts_ms: now_floor,
            price: self.last_price,
        });

        self.price_slope = 0.0015;
        self.price_slope_seeded = true;
        self.price_slope_sigma = 0.0005;
    }
}
