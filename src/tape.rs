// =============================================================================
// Price tape — per-pair second-resolution OHLCV bars with gap fill
// =============================================================================
//
// Every aggregated trade lands in the current second's bar. When a trade
// arrives in a later second the finished bar is flushed to the tape store and
// every skipped second is filled with a flat bar (open = high = low = close =
// previous close, zero volume) so that readers always see a contiguous tape.
//
// Store writes are best-effort: a transient failure is logged and the bar
// stays authoritative in memory for its second only.
// =============================================================================

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::TapeStore;

/// One second of trade activity for a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondBar {
    pub ts_sec: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Quote-notional volume accumulated over the second.
    pub volume: f64,
}

impl SecondBar {
    fn from_trade(ts_sec: i64, price: f64, volume_quote: f64) -> Self {
        Self {
            ts_sec,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: volume_quote,
        }
    }

    fn flat(ts_sec: i64, close: f64) -> Self {
        Self {
            ts_sec,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    fn absorb_trade(&mut self, price: f64, volume_quote: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume_quote;
    }
}

/// Encode a bar's five floats as `open,high,low,close,volume`.
pub fn encode_bar(bar: &SecondBar) -> String {
    format!(
        "{},{},{},{},{}",
        bar.open, bar.high, bar.low, bar.close, bar.volume
    )
}

/// Decode the five-float CSV produced by [`encode_bar`].
pub fn decode_bar(ts_sec: i64, csv: &str) -> Result<SecondBar> {
    let mut parts = csv.split(',');
    let mut next = || -> Result<f64> {
        parts
            .next()
            .context("bar CSV truncated")?
            .parse::<f64>()
            .context("bar CSV field is not a float")
    };
    let open = next()?;
    let high = next()?;
    let low = next()?;
    let close = next()?;
    let volume = next()?;
    Ok(SecondBar {
        ts_sec,
        open,
        high,
        low,
        close,
        volume,
    })
}

// ---------------------------------------------------------------------------
// PriceTape
// ---------------------------------------------------------------------------

/// Per-pair bar builders in front of a [`TapeStore`].
pub struct PriceTape {
    builders: RwLock<HashMap<String, SecondBar>>,
    store: Arc<dyn TapeStore>,
}

impl PriceTape {
    pub fn new(store: Arc<dyn TapeStore>) -> Self {
        Self {
            builders: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Fold one trade into the pair's current second bar.
    ///
    /// Advancing past the current second flushes the finished bar, writes a
    /// flat bar for every skipped second, then opens a fresh bar. Trades
    /// older than the current second are ignored.
    pub async fn on_trade(&self, pair: &str, price: f64, volume_quote: f64, ts_ms: i64) {
        let sec = ts_ms.div_euclid(1000);

        // Collect finished bars under the lock, write after releasing it.
        let mut to_write: Vec<SecondBar> = Vec::new();
        {
            let mut builders = self.builders.write();
            match builders.entry(pair.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(SecondBar::from_trade(sec, price, volume_quote));
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get_mut();
                    if sec == current.ts_sec {
                        current.absorb_trade(price, volume_quote);
                    } else if sec > current.ts_sec {
                        let finished = current.clone();
                        let prev_close = finished.close;
                        to_write.push(finished);
                        for gap_sec in (current.ts_sec + 1)..sec {
                            to_write.push(SecondBar::flat(gap_sec, prev_close));
                        }
                        *current = SecondBar::from_trade(sec, price, volume_quote);
                    }
                    // Trades behind the open bucket are dropped.
                }
            }
        }

        for bar in &to_write {
            if let Err(e) = self.store.put_bar(pair, bar).await {
                warn!(pair = %pair, ts_sec = bar.ts_sec, error = %e, "tape store write failed");
            }
        }
    }

    /// Every stored bar with `ts_sec ∈ [⌊start_ms/1000⌋, ⌊end_ms/1000⌋]`,
    /// ascending. Read errors surface to the caller.
    pub async fn get_sec_bars(&self, pair: &str, start_ms: i64, end_ms: i64) -> Result<Vec<SecondBar>> {
        self.store
            .get_bars(pair, start_ms.div_euclid(1000), end_ms.div_euclid(1000))
            .await
    }

    /// Best-effort flush of every pair's in-memory current bar.
    pub async fn flush(&self) {
        let pending: Vec<(String, SecondBar)> = {
            let builders = self.builders.read();
            builders
                .iter()
                .map(|(pair, bar)| (pair.clone(), bar.clone()))
                .collect()
        };

        for (pair, bar) in &pending {
            if let Err(e) = self.store.put_bar(pair, bar).await {
                warn!(pair = %pair, ts_sec = bar.ts_sec, error = %e, "tape flush write failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryTapeStore;

    fn tape() -> (PriceTape, Arc<MemoryTapeStore>) {
        let store = Arc::new(MemoryTapeStore::default());
        (PriceTape::new(store.clone()), store)
    }

    #[test]
    fn csv_round_trip() {
        let bar = SecondBar {
            ts_sec: 1_000,
            open: 100.25,
            high: 101.5,
            low: 99.875,
            close: 100.0,
            volume: 12345.678,
        };
        let decoded = decode_bar(bar.ts_sec, &encode_bar(&bar)).unwrap();
        assert_eq!(decoded, bar);
    }

    #[test]
    fn decode_rejects_truncated_csv() {
        assert!(decode_bar(0, "1.0,2.0,3.0").is_err());
        assert!(decode_bar(0, "1.0,2.0,3.0,4.0,bogus").is_err());
    }

    #[tokio::test]
    async fn same_second_trades_accumulate() {
        let (tape, store) = tape();
        tape.on_trade("BTCUSDT", 100.0, 500.0, 1_000_100).await;
        tape.on_trade("BTCUSDT", 101.0, 300.0, 1_000_400).await;
        tape.on_trade("BTCUSDT", 99.5, 200.0, 1_000_900).await;

        // Still in memory: nothing flushed yet.
        assert!(store.bars("BTCUSDT").is_empty());

        tape.flush().await;
        let bars = store.bars("BTCUSDT");
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.ts_sec, 1_000);
        assert!((bar.open - 100.0).abs() < 1e-12);
        assert!((bar.high - 101.0).abs() < 1e-12);
        assert!((bar.low - 99.5).abs() < 1e-12);
        assert!((bar.close - 99.5).abs() < 1e-12);
        assert!((bar.volume - 1000.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn gap_fill_writes_flat_bars() {
        let (tape, store) = tape();
        tape.on_trade("BTCUSDT", 100.0, 500.0, 1_000_000).await;
        tape.on_trade("BTCUSDT", 102.0, 800.0, 1_004_000).await;

        let bars = store.bars("BTCUSDT");
        assert_eq!(bars.len(), 4);
        assert_eq!(
            bars.iter().map(|b| b.ts_sec).collect::<Vec<_>>(),
            vec![1_000, 1_001, 1_002, 1_003]
        );
        // The traded bar.
        assert!((bars[0].close - 100.0).abs() < 1e-12);
        assert!((bars[0].volume - 500.0).abs() < 1e-12);
        // The flat fill.
        for bar in &bars[1..] {
            assert!((bar.open - 100.0).abs() < 1e-12);
            assert!((bar.close - 100.0).abs() < 1e-12);
            assert_eq!(bar.volume, 0.0);
        }

        // The new second is open in memory.
        tape.flush().await;
        let bars = store.bars("BTCUSDT");
        assert_eq!(bars.last().unwrap().ts_sec, 1_004);
        assert!((bars.last().unwrap().close - 102.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn late_trade_is_ignored() {
        let (tape, store) = tape();
        tape.on_trade("BTCUSDT", 100.0, 500.0, 1_005_000).await;
        tape.on_trade("BTCUSDT", 90.0, 100.0, 1_004_000).await;

        tape.flush().await;
        let bars = store.bars("BTCUSDT");
        assert_eq!(bars.len(), 1);
        assert!((bars[0].low - 100.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn range_read_is_inclusive_and_sorted() {
        let (tape, _store) = tape();
        for i in 0..10 {
            tape.on_trade("ETHUSDT", 100.0 + i as f64, 100.0, (2_000 + i) * 1000)
                .await;
        }
        tape.flush().await;

        let bars = tape.get_sec_bars("ETHUSDT", 2_002_000, 2_005_999).await.unwrap();
        assert_eq!(
            bars.iter().map(|b| b.ts_sec).collect::<Vec<_>>(),
            vec![2_002, 2_003, 2_004, 2_005]
        );
    }

    #[tokio::test]
    async fn pairs_are_isolated() {
        let (tape, store) = tape();
        tape.on_trade("BTCUSDT", 100.0, 500.0, 1_000_000).await;
        tape.on_trade("ETHUSDT", 2000.0, 700.0, 1_000_000).await;
        tape.flush().await;

        assert_eq!(store.bars("BTCUSDT").len(), 1);
        assert_eq!(store.bars("ETHUSDT").len(), 1);
        assert!((store.bars("ETHUSDT")[0].close - 2000.0).abs() < 1e-12);
    }
}
