// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Surge Sentinel engine: the curated pair
// universe (with market-cap tiers), the exchange label used for queue and
// document namespacing, and the store connection string.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Detector tuning knobs are compile-time constants below — they define the
// semantics of the feature engine and are not meant to drift per deployment.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Engine constants
// =============================================================================

/// Cadence of the periodic computation + gate tick (ms).
pub const CHECK_SIGNAL_INTERVAL_MS: i64 = 250;
/// Width of a rolling price bucket (ms).
pub const PRICE_BUCKET_DURATION_MS: i64 = 100;
/// Capacity of the per-pair aggregated-trade ring.
pub const AGG_TRADE_BUFFER_SIZE: usize = 250;
/// How far back the upward-impulse check reads the price buckets (ms).
pub const PRICE_LOOKBACK_WINDOW_MS: i64 = 2_500;
/// EWMA smoothing for the percent-per-second price slope.
pub const PRICE_SLOPE_ALPHA: f64 = 0.4;
/// Minimum slope z-score for the upward-impulse gate.
pub const PRICE_SLOPE_ZSCORE: f64 = 1.9;
/// Minimum number of trades inside the 1 s aggregation window.
pub const MIN_TRADES_IN_1S: u64 = 5;
/// Maximum bid/ask spread as a fraction of the ask.
pub const MAX_BID_ASK_SPREAD_PCT: f64 = 0.003;
/// Volume EWMA alphas: fast (~seconds), 1-minute, 5-minute baseline.
pub const VOLUME_EWMA_ALPHA_FAST: f64 = 0.1175;
pub const VOLUME_EWMA_ALPHA_1M: f64 = 0.00416;
pub const VOLUME_EWMA_ALPHA_5M: f64 = 0.000833;
/// Minimum 1-minute over 5-minute volume EWMA ratio.
pub const MIN_VOLUME_SPIKE_RATIO_1M5M: f64 = 1.5;
/// Minimum volume-acceleration z-score.
pub const VOLUME_ACCEL_ZSCORE: f64 = 2.0;
/// Minimum gap between two emissions for the same symbol (ms).
pub const SIGNAL_COOLDOWN_MS: i64 = 6_000;
/// How long cached UTC hour/day fields stay fresh (ms).
pub const TIME_CACHE_DURATION_MS: i64 = 60_000;
/// Expected notional of a single execution (USDT).
pub const EXPECTED_TRADE_SIZE_USDT: f64 = 500.0;
/// Top-5 depth must cover this many expected trades on the thinner side.
pub const MIN_EXECUTION_MULTIPLIER: f64 = 5.0;
/// Minimum 24 h quote volume to consider a pair at all (USDT).
pub const MIN_TICKER_24H_VOLUME_USDT: f64 = 1_000_000.0;
/// Seconds in a (non-leap) year, for volatility annualisation.
pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;
/// Maximum stream topics multiplexed onto one WebSocket connection.
pub const MAX_TOPICS_PER_CONNECTION: usize = 180;
/// Application-level ping cadence per connection (secs).
pub const WS_PING_INTERVAL_SECS: u64 = 20;
/// Delay before a dropped connection re-subscribes its chunk (secs).
pub const WS_RECONNECT_DELAY_SECS: u64 = 2;
/// Second-bar retention in the tape store (days).
pub const TAPE_TTL_DAYS: i64 = 45;
/// Delay before the price-trajectory follow-up runs (ms).
pub const TRAJECTORY_DELAY_MS: i64 = 31 * 60 * 1000;
/// Orderbook follow-up offsets from emission (secs).
pub const ORDERBOOK_OFFSETS_SEC: [i64; 3] = [3, 10, 30];

// =============================================================================
// Tier
// =============================================================================

/// Coarse market-cap bucket controlling liquidity floors and volatility caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Mega,
    Large,
    Mid,
    Small,
    Micro,
}

impl Tier {
    /// Upper bound on annualised 5-minute realised volatility.
    pub fn volatility_cap(self) -> f64 {
        match self {
            Tier::Mega => 0.50,
            Tier::Large => 0.80,
            Tier::Mid => 1.20,
            Tier::Small => 2.00,
            Tier::Micro => 3.00,
        }
    }

    /// Absolute floor on 1 s quote volume (USDT).
    pub fn volume_floor(self) -> f64 {
        match self {
            Tier::Mega => 1000.0,
            Tier::Large => 600.0,
            Tier::Mid => 500.0,
            Tier::Small => 400.0,
            Tier::Micro => 300.0,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Mega => "mega",
            Tier::Large => "large",
            Tier::Mid => "mid",
            Tier::Small => "small",
            Tier::Micro => "micro",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// PairSpec
// =============================================================================

/// A monitored trading pair and its tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSpec {
    pub symbol: String,
    pub tier: Tier,
}

impl PairSpec {
    pub fn new(symbol: impl Into<String>, tier: Tier) -> Self {
        Self {
            symbol: symbol.into(),
            tier,
        }
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_pairs() -> Vec<PairSpec> {
    vec![
        PairSpec::new("BTCUSDT", Tier::Mega),
        PairSpec::new("ETHUSDT", Tier::Mega),
        PairSpec::new("BNBUSDT", Tier::Large),
        PairSpec::new("SOLUSDT", Tier::Large),
        PairSpec::new("XRPUSDT", Tier::Mid),
        PairSpec::new("DOGEUSDT", Tier::Mid),
        PairSpec::new("AVAXUSDT", Tier::Small),
        PairSpec::new("NEARUSDT", Tier::Small),
    ]
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Surge Sentinel engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Exchange label used to namespace queues, task kinds and documents.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// The curated pair universe with market-cap tiers.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<PairSpec>,

    /// Connection string for the tape / document / queue store.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            pairs: default_pairs(),
            redis_url: default_redis_url(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = config.pairs.len(),
            exchange = %config.exchange,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
