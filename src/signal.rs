// =============================================================================
// Signal vector — the emitted observation record
// =============================================================================
//
// Every numeric feature the monitor computes at trigger time, frozen into one
// immutable record. The serialised field names are the storage contract for
// downstream labelling jobs; do not rename without migrating stored documents.
//
// Units:
//   - prices in quote currency, volumes in quote notional (USDT)
//   - spreads as fractions unless the name says bps
//   - volatilities annualised (log-return stddev × √seconds-per-year)
//   - slope in percent-per-second, already EWMA-smoothed
// =============================================================================

use serde::{Deserialize, Serialize};

/// Immutable feature vector emitted when the signal gate passes.
///
/// Persisted exactly once per emission; the store assigns the document id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalVector {
    pub exchange: String,
    /// RFC 3339 stamp of the trigger tick.
    pub created_at: String,
    /// Upper-cased, alphanumeric-only pair symbol.
    pub symbol: String,
    pub signal_timestamp_ms: i64,
    pub trigger_price: f64,

    // -- price impulse --------------------------------------------------------
    pub price_change_pct: f64,
    pub price_slope: f64,
    pub slope_z: f64,
    pub price_z_score: f64,

    // -- volume spike ---------------------------------------------------------
    pub volume_ratio_fast_1m: f64,
    pub volume_ratio_1m_5m: f64,
    pub volume_accel_z: f64,
    pub current_1s_volume_usdt: f64,
    pub volume_per_dollar: f64,
    pub dyn_volume_thresh: f64,

    // -- volatility -----------------------------------------------------------
    #[serde(rename = "volatility30s")]
    pub volatility_30s: f64,
    #[serde(rename = "volatility5m")]
    pub volatility_5m: f64,
    pub volatility_ratio: f64,

    // -- spread ---------------------------------------------------------------
    pub spread_pct: f64,
    pub spread_bps: f64,
    pub normalized_spread: f64,
    pub effective_spread_bps: f64,

    // -- depth ----------------------------------------------------------------
    pub depth5_ob_imbalance: f64,
    pub depth5_bid_volume: f64,
    pub depth5_ask_volume: f64,
    pub depth5_total_volume: f64,
    pub depth5_volume_ratio: f64,
    #[serde(rename = "imbalanceMA5")]
    pub imbalance_ma5: f64,
    #[serde(rename = "imbalanceMA20")]
    pub imbalance_ma20: f64,
    pub imbalance_velocity: f64,
    pub imbalance_volatility: f64,

    // -- taker flow -----------------------------------------------------------
    pub taker_ratio_smoothed: f64,
    pub taker_buy_volume_abs: f64,
    pub taker_flow_imbalance: f64,
    pub taker_flow_magnitude: f64,
    pub taker_flow_ratio: f64,

    // -- oscillators ----------------------------------------------------------
    pub ppo_histogram: f64,
    pub ppo_line: f64,
    pub signal_line: f64,
    pub rsi9: f64,

    // -- EMA stack ------------------------------------------------------------
    pub ema9_over21: bool,
    pub ema21_over50: bool,
    pub ema_alignment_strength: f64,
    pub ema_stacked_bullish: bool,
    pub ema_stacked_bearish: bool,
    pub ema_stacked_neutral: bool,
    pub price_above_ema9: bool,

    // -- 24 h ticker context --------------------------------------------------
    pub ticker_24hr_volume_usdt: f64,
    pub ticker_24hr_price_change_pct: f64,
    pub ticker_24hr_high: f64,
    pub ticker_24hr_low: f64,

    // -- session --------------------------------------------------------------
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub is_weekend: bool,
}

/// Upper-case and strip everything outside `[A-Za-z0-9]`.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
