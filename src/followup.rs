// =============================================================================
// Follow-up dispatcher — persist the signal, schedule the labelling tasks
// =============================================================================
//
// One emission produces four delayed tasks: three orderbook snapshots shortly
// after the trigger and one price-trajectory capture half an hour later. A
// failed persist drops the whole emission (nothing to attach follow-ups to);
// a failed enqueue only loses that one task.
// =============================================================================

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{ORDERBOOK_OFFSETS_SEC, TRAJECTORY_DELAY_MS};
use crate::signal::SignalVector;
use crate::store::{SignalSink, TaskScheduler};

pub struct FollowupDispatcher {
    exchange: String,
    sink: Arc<dyn SignalSink>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl FollowupDispatcher {
    pub fn new(
        exchange: impl Into<String>,
        sink: Arc<dyn SignalSink>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            sink,
            scheduler,
        }
    }

    /// Persist `vector` and schedule its follow-up tasks.
    pub async fn dispatch(&self, vector: &SignalVector) {
        let id = match self.sink.persist(vector).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    symbol = %vector.symbol,
                    error = %e,
                    "signal persist failed — follow-ups skipped"
                );
                return;
            }
        };

        info!(
            symbol = %vector.symbol,
            id = %id,
            price = vector.trigger_price,
            "signal emitted"
        );

        let order_queue = format!("{}_order", self.exchange);
        let orderbook_kind = format!("{}_orderbook", self.exchange);
        for offset_sec in ORDERBOOK_OFFSETS_SEC {
            let payload = json!({
                "id": id,
                "symbol": vector.symbol,
                "tOffset": offset_sec,
            });
            if let Err(e) = self
                .scheduler
                .enqueue(&order_queue, &orderbook_kind, payload, offset_sec * 1_000)
                .await
            {
                warn!(
                    id = %id,
                    offset_sec,
                    error = %e,
                    "orderbook follow-up enqueue failed"
                );
            }
        }

        let price_queue = format!("{}_price", self.exchange);
        let payload = json!({
            "id": id,
            "symbol": vector.symbol,
            "timestamp": vector.signal_timestamp_ms,
        });
        if let Err(e) = self
            .scheduler
            .enqueue(&price_queue, &price_queue, payload, TRAJECTORY_DELAY_MS)
            .await
        {
            warn!(id = %id, error = %e, "trajectory follow-up enqueue failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::store::memory::{MemoryScheduler, MemorySink};

    fn sample_vector() -> SignalVector {
        SignalVector {
            exchange: "binance".into(),
            created_at: "2026-07-01T10:00:00Z".into(),
            symbol: "BTCUSDT".into(),
            signal_timestamp_ms: 1_700_000_000_000,
            trigger_price: 100.3,
            price_change_pct: 0.003,
            price_slope: 0.0015,
            slope_z: 3.0,
            price_z_score: 21.0,
            volume_ratio_fast_1m: 12.5,
            volume_ratio_1m_5m: 2.0,
            volume_accel_z: 5.0,
            current_1s_volume_usdt: 2_000.0,
            volume_per_dollar: 34.5,
            dyn_volume_thresh: 4.0,
            volatility_30s: 0.8,
            volatility_5m: 0.6,
            volatility_ratio: 1.33,
            spread_pct: 0.0002,
            spread_bps: 2.0,
            normalized_spread: 0.8,
            effective_spread_bps: 1.2,
            depth5_ob_imbalance: 0.0,
            depth5_bid_volume: 40.0,
            depth5_ask_volume: 40.0,
            depth5_total_volume: 80.0,
            depth5_volume_ratio: 1.0,
            imbalance_ma5: 0.0,
            imbalance_ma20: 0.0,
            imbalance_velocity: 0.0,
            imbalance_volatility: 0.0,
            taker_ratio_smoothed: 80.0,
            taker_buy_volume_abs: 2_000.0,
            taker_flow_imbalance: 1.0,
            taker_flow_magnitude: 2_000.0,
            taker_flow_ratio: 100.0,
            ppo_histogram: 0.0,
            ppo_line: 0.0,
            signal_line: 0.0,
            rsi9: 50.0,
            ema9_over21: false,
            ema21_over50: false,
            ema_alignment_strength: 0.0,
            ema_stacked_bullish: false,
            ema_stacked_bearish: false,
            ema_stacked_neutral: true,
            price_above_ema9: true,
            ticker_24hr_volume_usdt: 5_000_000.0,
            ticker_24hr_price_change_pct: 2.5,
            ticker_24hr_high: 101.0,
            ticker_24hr_low: 99.0,
            hour_of_day: 10,
            day_of_week: 3,
            is_weekend: false,
        }
    }

    #[tokio::test]
    async fn dispatch_persists_and_schedules_four_tasks() {
        let sink = Arc::new(MemorySink::default());
        let scheduler = Arc::new(MemoryScheduler::default());
        let dispatcher = FollowupDispatcher::new("binance", sink.clone(), scheduler.clone());

        dispatcher.dispatch(&sample_vector()).await;

        let signals = sink.signals();
        assert_eq!(signals.len(), 1);
        let id = signals[0].0.clone();

        let tasks = scheduler.scheduled();
        assert_eq!(tasks.len(), 4);

        let order_tasks: Vec<_> = tasks.iter().filter(|t| t.queue == "binance_order").collect();
        assert_eq!(order_tasks.len(), 3);
        assert_eq!(
            order_tasks.iter().map(|t| t.delay_ms).collect::<Vec<_>>(),
            vec![3_000, 10_000, 30_000]
        );
        for (task, offset) in order_tasks.iter().zip([3, 10, 30]) {
            assert_eq!(task.kind, "binance_orderbook");
            assert_eq!(task.payload["id"], Value::from(id.clone()));
            assert_eq!(task.payload["symbol"], Value::from("BTCUSDT"));
            assert_eq!(task.payload["tOffset"], Value::from(offset));
        }

        let price_tasks: Vec<_> = tasks.iter().filter(|t| t.queue == "binance_price").collect();
        assert_eq!(price_tasks.len(), 1);
        assert_eq!(price_tasks[0].kind, "binance_price");
        assert_eq!(price_tasks[0].delay_ms, 1_860_000);
        assert_eq!(price_tasks[0].payload["timestamp"], Value::from(1_700_000_000_000_i64));
    }

    #[tokio::test]
    async fn persist_failure_skips_all_enqueues() {
        struct FailingSink;

        #[async_trait]
        impl crate::store::SignalSink for FailingSink {
            async fn persist(&self, _vector: &SignalVector) -> Result<String> {
                anyhow::bail!("store down")
            }
        }

        let scheduler = Arc::new(MemoryScheduler::default());
        let dispatcher =
            FollowupDispatcher::new("binance", Arc::new(FailingSink), scheduler.clone());

        dispatcher.dispatch(&sample_vector()).await;
        assert!(scheduler.scheduled().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failures_are_independent() {
        use parking_lot::Mutex;

        /// Fails the first enqueue only.
        #[derive(Default)]
        struct FlakyScheduler {
            calls: Mutex<u32>,
            inner: MemoryScheduler,
        }

        #[async_trait]
        impl crate::store::TaskScheduler for FlakyScheduler {
            async fn enqueue(
                &self,
                queue: &str,
                kind: &str,
                payload: Value,
                delay_ms: i64,
            ) -> Result<()> {
                let mut calls = self.calls.lock();
                *calls += 1;
                if *calls == 1 {
                    anyhow::bail!("queue hiccup");
                }
                drop(calls);
                self.inner.enqueue(queue, kind, payload, delay_ms).await
            }

            async fn claim_due(
                &self,
                queue: &str,
                limit: usize,
            ) -> Result<Vec<crate::store::QueuedTask>> {
                self.inner.claim_due(queue, limit).await
            }
        }

        let sink = Arc::new(MemorySink::default());
        let scheduler = Arc::new(FlakyScheduler::default());
        let dispatcher = FollowupDispatcher::new("binance", sink, scheduler.clone());

        dispatcher.dispatch(&sample_vector()).await;
        // The first orderbook task was lost; the other three still landed.
        assert_eq!(scheduler.inner.scheduled().len(), 3);
    }
}
