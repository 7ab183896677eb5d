// =============================================================================
// Periodic computation — the ten-step 250 ms update
// =============================================================================
//
// Runs once per monitor per tick, in a fixed order. Every step reads only the
// monitor's own bounded state, so the whole pass is synchronous and
// allocation-light; the only transient allocations are the two small return
// windows for the volatility estimate.
// =============================================================================

use crate::config::{
    PRICE_BUCKET_DURATION_MS, PRICE_SLOPE_ALPHA, SECONDS_PER_YEAR, VOLUME_EWMA_ALPHA_1M,
    VOLUME_EWMA_ALPHA_5M, VOLUME_EWMA_ALPHA_FAST,
};

use super::{
    population_stddev, sample_stddev, PriceBucket, SymbolMonitor, TimedReturn, EPS,
};

/// Prices consumed before the Wilder averages are seeded.
const RSI_SEED_WINDOW: usize = 10;
/// Wilder smoothing period.
const RSI_PERIOD: f64 = 9.0;

/// PPO EMA alphas: fast 3, slow 10, signal 16 (α = 2/(N+1)).
const PPO_ALPHA_FAST: f64 = 2.0 / 4.0;
const PPO_ALPHA_SLOW: f64 = 2.0 / 11.0;
const PPO_ALPHA_SIGNAL: f64 = 2.0 / 17.0;

/// EMA stack alphas for N ∈ {9, 21, 50}.
const EMA_ALPHA_9: f64 = 2.0 / 10.0;
const EMA_ALPHA_21: f64 = 2.0 / 22.0;
const EMA_ALPHA_50: f64 = 2.0 / 51.0;

/// Smoothing for the clipped taker buy/sell ratio.
const TAKER_RATIO_ALPHA: f64 = 0.20;

impl SymbolMonitor {
    /// Advance every streaming estimator to `now_ms`.
    pub fn perform_periodic_calculations(&mut self, now_ms: i64) {
        self.update_realised_volatility(now_ms);
        self.aggregate_last_second(now_ms);
        self.update_volume_ewmas();
        self.update_price_bucket(now_ms);
        self.update_ema_stack();
        self.update_rsi();
        self.update_ppo();
        self.update_taker_flow();
        self.update_accel_sigma();
        self.update_price_slope(now_ms);
    }

    // -- 1. realised volatility from log returns ------------------------------

    fn update_realised_volatility(&mut self, now_ms: i64) {
        // Sample at most once per second.
        if self.last_price > 0.0 && now_ms - self.last_return_sample_ms >= 1_000 {
            if self.return_ref_price > 0.0 {
                self.return_history.push(TimedReturn {
                    at_ms: now_ms,
                    log_return: (self.last_price / self.return_ref_price).ln(),
                });
            }
            self.return_ref_price = self.last_price;
            self.last_return_sample_ms = now_ms;
        }

        let annualise = SECONDS_PER_YEAR.sqrt();

        let window_30s: Vec<f64> = self
            .return_history
            .iter()
            .filter(|r| r.at_ms >= now_ms - 30_000)
            .map(|r| r.log_return)
            .collect();
        if window_30s.len() >= 10 {
            self.volatility_30s = sample_stddev(window_30s.iter()) * annualise;
        }

        let window_5m: Vec<f64> = self
            .return_history
            .iter()
            .filter(|r| r.at_ms >= now_ms - 300_000)
            .map(|r| r.log_return)
            .collect();
        if window_5m.len() >= 30 {
            self.volatility_5m = sample_stddev(window_5m.iter()) * annualise;
        }

        self.volatility_ratio = if self.volatility_5m > 0.0 {
            self.volatility_30s / self.volatility_5m
        } else {
            1.0
        };
    }

    // -- 2. one-second trade aggregation --------------------------------------

    fn aggregate_last_second(&mut self, now_ms: i64) {
        let cutoff = now_ms - 1_000;
        let mut vol = 0.0;
        let mut count = 0u64;
        let mut taker_buy = 0.0;
        let mut taker_sell = 0.0;

        for trade in self.agg_trades.iter().rev() {
            if trade.event_time_ms < cutoff {
                break;
            }
            let notional = trade.price * trade.qty;
            vol += notional;
            count += 1;
            if trade.buyer_is_maker {
                taker_sell += notional;
            } else {
                taker_buy += notional;
            }
        }

        self.vol_1s = vol;
        self.trade_count_1s = count;
        self.taker_buy_1s = taker_buy;
        self.taker_sell_1s = taker_sell;
    }

    // -- 3. volume EWMAs ------------------------------------------------------

    fn update_volume_ewmas(&mut self) {
        if !self.ewma_seeded {
            if self.vol_1s > 0.0 {
                self.ewma_fast = self.vol_1s;
                self.ewma_1m = self.vol_1s;
                self.ewma_5m = self.vol_1s;
                self.ewma_seeded = true;
                self.volume_accel = 0.0;
            }
            return;
        }

        let prev_fast = self.ewma_fast;
        self.ewma_fast += VOLUME_EWMA_ALPHA_FAST * (self.vol_1s - self.ewma_fast);
        self.ewma_1m += VOLUME_EWMA_ALPHA_1M * (self.vol_1s - self.ewma_1m);
        self.ewma_5m += VOLUME_EWMA_ALPHA_5M * (self.vol_1s - self.ewma_5m);
        self.volume_accel = self.ewma_fast - prev_fast;
    }

    // -- 4. rolling price bucket ----------------------------------------------

    fn update_price_bucket(&mut self, now_ms: i64) {
        if self.last_price <= 0.0 {
            return;
        }
        let bucket_floor = now_ms.div_euclid(PRICE_BUCKET_DURATION_MS) * PRICE_BUCKET_DURATION_MS;
        let bucket_is_open =
            matches!(self.price_buckets.newest(), Some(b) if b.ts_ms == bucket_floor);
        if bucket_is_open {
            if let Some(bucket) = self.price_buckets.newest_mut() {
                bucket.price = self.last_price;
            }
        } else {
            self.price_buckets.push(PriceBucket {
                ts_ms: bucket_floor,
                price: self.last_price,
            });
        }
    }

    /// Price of the newest bucket at or before `target_ms`.
    pub(crate) fn bucket_price_at(&self, target_ms: i64) -> Option<f64> {
        self.price_buckets
            .iter()
            .rev()
            .find(|b| b.ts_ms <= target_ms)
            .map(|b| b.price)
    }

    // -- 5. EMA stack ---------------------------------------------------------

    fn update_ema_stack(&mut self) {
        if self.last_price <= 0.0 {
            return;
        }
        let price = self.last_price;

        if !self.ema_seeded {
            self.ema9 = price;
            self.ema21 = price;
            self.ema50 = price;
            self.ema_seeded = true;
        } else {
            self.ema9 += EMA_ALPHA_9 * (price - self.ema9);
            self.ema21 += EMA_ALPHA_21 * (price - self.ema21);
            self.ema50 += EMA_ALPHA_50 * (price - self.ema50);
        }

        self.ema_stacked_bullish = self.ema9 > self.ema21 && self.ema21 > self.ema50;
        self.ema_stacked_bearish = self.ema9 < self.ema21 && self.ema21 < self.ema50;
        self.ema_alignment_strength =
            (self.ema9 - self.ema21) / price + (self.ema21 - self.ema50) / price;
        self.price_above_ema9 = price > self.ema9;
    }

    // -- 6. RSI(9) with Wilder smoothing --------------------------------------

    fn update_rsi(&mut self) {
        if self.last_price <= 0.0 {
            return;
        }
        let prev = self.rsi_price_history.newest().copied();
        self.rsi_price_history.push(self.last_price);

        if !self.rsi_seeded {
            if self.rsi_price_history.len() >= RSI_SEED_WINDOW {
                let prices = self.rsi_price_history.to_vec();
                let (mut gains, mut losses) = (0.0_f64, 0.0_f64);
                for w in prices.windows(2) {
                    let delta = w[1] - w[0];
                    if delta > 0.0 {
                        gains += delta;
                    } else {
                        losses += -delta;
                    }
                }
                self.rsi_avg_gain = gains / RSI_PERIOD;
                self.rsi_avg_loss = losses / RSI_PERIOD;
                self.rsi_seeded = true;
            }
        } else if let Some(prev) = prev {
            let delta = self.last_price - prev;
            let gain = delta.max(0.0);
            let loss = (-delta).max(0.0);
            self.rsi_avg_gain = (self.rsi_avg_gain * (RSI_PERIOD - 1.0) + gain) / RSI_PERIOD;
            self.rsi_avg_loss = (self.rsi_avg_loss * (RSI_PERIOD - 1.0) + loss) / RSI_PERIOD;
        }

        if self.rsi_seeded {
            self.rsi9 = rsi_from_averages(self.rsi_avg_gain, self.rsi_avg_loss);
        }
    }

    // -- 7. PPO ---------------------------------------------------------------

    fn update_ppo(&mut self) {
        if self.last_price <= 0.0 {
            return;
        }
        let price = self.last_price;

        if !self.ppo_price_seeded {
            self.ppo_ema_fast = price;
            self.ppo_ema_slow = price;
            self.ppo_price_seeded = true;
        } else {
            self.ppo_ema_fast += PPO_ALPHA_FAST * (price - self.ppo_ema_fast);
            self.ppo_ema_slow += PPO_ALPHA_SLOW * (price - self.ppo_ema_slow);
        }

        if self.ppo_ema_slow > 0.0 {
            self.ppo_line = (self.ppo_ema_fast - self.ppo_ema_slow) / self.ppo_ema_slow * 100.0;
            if !self.ppo_signal_seeded {
                self.ppo_signal_line = self.ppo_line;
                self.ppo_signal_seeded = true;
            } else {
                self.ppo_signal_line += PPO_ALPHA_SIGNAL * (self.ppo_line - self.ppo_signal_line);
            }
            self.ppo_histogram = self.ppo_line - self.ppo_signal_line;
        }
    }

    // -- 8. taker flow --------------------------------------------------------

    fn update_taker_flow(&mut self) {
        let buy = self.taker_buy_1s;
        let sell = self.taker_sell_1s;

        self.taker_flow_imbalance = (buy - sell) / (buy + sell + EPS);
        self.taker_flow_magnitude = buy + sell;
        self.taker_flow_ratio = (buy / (sell + EPS)).min(100.0);

        if !self.taker_ratio_seeded {
            self.taker_ratio_smoothed = self.taker_flow_ratio;
            self.taker_ratio_seeded = true;
        } else {
            self.taker_ratio_smoothed +=
                TAKER_RATIO_ALPHA * (self.taker_flow_ratio - self.taker_ratio_smoothed);
        }
    }

    // -- 9. volume-acceleration sigma -----------------------------------------

    fn update_accel_sigma(&mut self) {
        self.volume_accel_history.push(self.volume_accel);
        if self.volume_accel_history.len() >= 20 {
            self.accel_sigma = population_stddev(self.volume_accel_history.iter());
        }
    }

    // -- 10. price slope ------------------------------------------------------

    fn update_price_slope(&mut self, now_ms: i64) {
        if self.last_price <= 0.0 {
            return;
        }
        let Some(price_then) = self.bucket_price_at(now_ms - 2_000) else {
            return;
        };
        if price_then <= 0.0 {
            return;
        }

        // Percent-per-second over the 2 s lookback.
        let slope_per_sec = ((self.last_price - price_then) / price_then) / 2.0;

        if !self.price_slope_seeded {
            self.price_slope = slope_per_sec;
            self.price_slope_seeded = true;
        } else {
            self.price_slope += PRICE_SLOPE_ALPHA * (slope_per_sec - self.price_slope);
        }

        self.price_slope_history.push(self.price_slope);
        if self.price_slope_history.len() >= 20 {
            self.price_slope_sigma = population_stddev(self.price_slope_history.iter());
        }
    }
}

/// RSI in [0, 100]: 50 with no movement at all, 100 with no losses.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.clamp(0.0, 100.0)
}
