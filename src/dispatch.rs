// =============================================================================
// Dispatch stage — single owner of every symbol monitor
// =============================================================================
//
// One task owns the whole monitor map. Canonical events and the 250 ms tick
// are serialised through the same select loop, so per-symbol state is never
// touched concurrently and the gate always observes a consistent snapshot.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::config::{PairSpec, CHECK_SIGNAL_INTERVAL_MS};
use crate::followup::FollowupDispatcher;
use crate::market_data::events::MarketEvent;
use crate::monitor::{AggTrade, SymbolMonitor};
use crate::tape::PriceTape;

pub struct Dispatcher {
    monitors: HashMap<String, SymbolMonitor>,
    /// Tick iteration order: fixed at startup, each monitor visited once.
    tick_order: Vec<String>,
    tape: Arc<PriceTape>,
    followups: FollowupDispatcher,
}

impl Dispatcher {
    /// Build one monitor per configured pair. Monitors are never added or
    /// removed after startup.
    pub fn new(
        pairs: &[PairSpec],
        exchange: &str,
        tape: Arc<PriceTape>,
        followups: FollowupDispatcher,
    ) -> Self {
        let mut monitors = HashMap::new();
        let mut tick_order = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let symbol = pair.symbol.to_uppercase();
            monitors.insert(
                symbol.clone(),
                SymbolMonitor::new(symbol.clone(), pair.tier, exchange),
            );
            tick_order.push(symbol);
        }
        tick_order.sort();

        Self {
            monitors,
            tick_order,
            tape,
            followups,
        }
    }

    pub fn monitor(&self, symbol: &str) -> Option<&SymbolMonitor> {
        self.monitors.get(symbol)
    }

    #[cfg(test)]
    pub(crate) fn monitor_mut(&mut self, symbol: &str) -> Option<&mut SymbolMonitor> {
        self.monitors.get_mut(symbol)
    }

    /// Route one canonical event to its monitor; events for symbols outside
    /// the universe are dropped silently.
    pub async fn handle_event(&mut self, event: MarketEvent) {
        let Some(monitor) = self.monitors.get_mut(event.symbol()) else {
            return;
        };

        match event {
            MarketEvent::AggTrade {
                symbol,
                price,
                qty,
                event_time_ms,
                buyer_is_maker,
            } => {
                monitor.add_agg_trade(AggTrade {
                    price,
                    qty,
                    event_time_ms,
                    buyer_is_maker,
                });
                self.tape
                    .on_trade(&symbol, price, price * qty, event_time_ms)
                    .await;
            }
            MarketEvent::Ticker {
                quote_volume_24h,
                change_pct_24h,
                high_24h,
                low_24h,
                last,
                ..
            } => {
                monitor.apply_ticker(quote_volume_24h, change_pct_24h, high_24h, low_24h, last);
            }
            MarketEvent::BookTicker {
                best_bid, best_ask, ..
            } => {
                monitor.apply_book_ticker(best_bid, best_ask);
            }
            MarketEvent::Depth5 { bids, asks, .. } => {
                monitor.update_depth_snapshot(&bids, &asks);
            }
        }
    }

    /// One periodic pass: advance every monitor, then evaluate its gate.
    pub async fn tick(&mut self, now_ms: i64) {
        let order = std::mem::take(&mut self.tick_order);
        for symbol in &order {
            if let Some(monitor) = self.monitors.get_mut(symbol) {
                monitor.perform_periodic_calculations(now_ms);
                if let Some(vector) = monitor.check_signal(now_ms) {
                    self.followups.dispatch(&vector).await;
                }
            }
        }
        self.tick_order = order;
    }

    /// Run until the transport channel closes or shutdown is signalled, then
    /// flush the tape.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MarketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(
            CHECK_SIGNAL_INTERVAL_MS as u64,
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tick.tick() => {
                    let now_ms = Utc::now().timestamp_millis();
                    self.tick(now_ms).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.tape.flush().await;
        info!("dispatch stage stopped — tape flushed");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::Tier;
    use crate::store::memory::{MemoryScheduler, MemorySink, MemoryTapeStore};

    fn fixture() -> (Dispatcher, Arc<MemorySink>, Arc<MemoryScheduler>, Arc<MemoryTapeStore>) {
        let tape_store = Arc::new(MemoryTapeStore::default());
        let tape = Arc::new(PriceTape::new(tape_store.clone()));
        let sink = Arc::new(MemorySink::default());
        let scheduler = Arc::new(MemoryScheduler::default());
        let followups = FollowupDispatcher::new("binance", sink.clone(), scheduler.clone());
        let pairs = vec![
            PairSpec::new("BTCUSDT", Tier::Mid),
            PairSpec::new("ETHUSDT", Tier::Mega),
        ];
        let dispatcher = Dispatcher::new(&pairs, "binance", tape, followups);
        (dispatcher, sink, scheduler, tape_store)
    }

    fn weekday_ms() -> i64 {
        Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[tokio::test]
    async fn ticker_routes_to_the_owning_monitor() {
        let (mut d, _, _, _) = fixture();
        d.handle_event(MarketEvent::Ticker {
            symbol: "BTCUSDT".into(),
            quote_volume_24h: 5_000_000.0,
            change_pct_24h: 1.5,
            high_24h: 105.0,
            low_24h: 95.0,
            last: 100.0,
        })
        .await;

        let m = d.monitor("BTCUSDT").unwrap();
        assert!((m.ticker_24h_volume_usdt - 5_000_000.0).abs() < 1e-9);
        assert!((m.last_price - 100.0).abs() < 1e-9);
        // The sibling monitor is untouched.
        assert_eq!(d.monitor("ETHUSDT").unwrap().ticker_24h_volume_usdt, 0.0);
    }

    #[tokio::test]
    async fn unknown_symbol_is_dropped_silently() {
        let (mut d, _, _, _) = fixture();
        d.handle_event(MarketEvent::BookTicker {
            symbol: "DOGEUSDT".into(),
            best_bid: 1.0,
            best_ask: 1.1,
        })
        .await;
        assert!(d.monitor("DOGEUSDT").is_none());
    }

    #[tokio::test]
    async fn trades_feed_the_price_tape() {
        let (mut d, _, _, tape_store) = fixture();
        d.handle_event(MarketEvent::AggTrade {
            symbol: "BTCUSDT".into(),
            price: 100.0,
            qty: 2.0,
            event_time_ms: 1_000_000,
            buyer_is_maker: false,
        })
        .await;
        // Advancing a second flushes the previous bar.
        d.handle_event(MarketEvent::AggTrade {
            symbol: "BTCUSDT".into(),
            price: 101.0,
            qty: 1.0,
            event_time_ms: 1_001_000,
            buyer_is_maker: false,
        })
        .await;

        let bars = tape_store.bars("BTCUSDT");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts_sec, 1_000);
        assert!((bars[0].volume - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn passing_gate_emits_signal_and_four_tasks() {
        let (mut d, sink, scheduler, _) = fixture();
        let now = weekday_ms();

        {
            let m = d.monitor_mut("BTCUSDT").unwrap();
            m.force_fireable(now);
            // Leave room for the periodic pass to still read a spike.
            m.ewma_fast = 300.0;
            m.ewma_1m = 60.0;
            m.ewma_5m = 30.0;
            m.price_slope_seeded = false;
        }

        for i in 0..30_i64 {
            let price = 100.00 + 0.30 * (i as f64 + 1.0) / 30.0;
            let qty = (2_000.0 / 30.0) / price;
            d.handle_event(MarketEvent::AggTrade {
                symbol: "BTCUSDT".into(),
                price,
                qty,
                event_time_ms: now - 900 + i * 30,
                buyer_is_maker: false,
            })
            .await;
        }

        d.tick(now).await;

        assert_eq!(sink.signals().len(), 1);
        let tasks = scheduler.scheduled();
        assert_eq!(tasks.len(), 4);
        let mut delays: Vec<i64> = tasks.iter().map(|t| t.delay_ms).collect();
        delays.sort();
        assert_eq!(delays, vec![3_000, 10_000, 30_000, 1_860_000]);

        // The next tick is inside the cooldown: nothing new is emitted.
        d.tick(now + 250).await;
        assert_eq!(sink.signals().len(), 1);
        assert_eq!(scheduler.scheduled().len(), 4);
    }
}
