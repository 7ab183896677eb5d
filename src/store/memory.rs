// =============================================================================
// In-memory store implementations — test doubles for the store seams
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::signal::SignalVector;
use crate::tape::SecondBar;
use crate::workers::orderbook::{OrderbookDoc, OrderbookSnapshot};
use crate::workers::trajectory::TrajectoryDoc;

use super::{DocumentStore, QueuedTask, SignalSink, TapeStore, TaskScheduler};

// ---------------------------------------------------------------------------
// Tape
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTapeStore {
    bars: RwLock<HashMap<String, BTreeMap<i64, SecondBar>>>,
}

impl MemoryTapeStore {
    /// All stored bars for `pair`, ascending.
    pub fn bars(&self, pair: &str) -> Vec<SecondBar> {
        self.bars
            .read()
            .get(pair)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed a bar directly (for worker tests).
    pub fn insert(&self, pair: &str, bar: SecondBar) {
        self.bars
            .write()
            .entry(pair.to_string())
            .or_default()
            .insert(bar.ts_sec, bar);
    }
}

#[async_trait]
impl TapeStore for MemoryTapeStore {
    async fn put_bar(&self, pair: &str, bar: &SecondBar) -> Result<()> {
        self.insert(pair, bar.clone());
        Ok(())
    }

    async fn get_bars(&self, pair: &str, start_sec: i64, end_sec: i64) -> Result<Vec<SecondBar>> {
        Ok(self
            .bars
            .read()
            .get(pair)
            .map(|m| m.range(start_sec..=end_sec).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Signal sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySink {
    signals: RwLock<Vec<(String, SignalVector)>>,
}

impl MemorySink {
    pub fn signals(&self) -> Vec<(String, SignalVector)> {
        self.signals.read().clone()
    }
}

#[async_trait]
impl SignalSink for MemorySink {
    async fn persist(&self, vector: &SignalVector) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.signals.write().push((id.clone(), vector.clone()));
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A recorded enqueue, with its requested delay instead of a wall-clock
/// dispatch time so tests stay deterministic.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub queue: String,
    pub kind: String,
    pub payload: Value,
    pub delay_ms: i64,
}

#[derive(Default)]
pub struct MemoryScheduler {
    tasks: RwLock<Vec<ScheduledTask>>,
}

impl MemoryScheduler {
    pub fn scheduled(&self) -> Vec<ScheduledTask> {
        self.tasks.read().clone()
    }
}

#[async_trait]
impl TaskScheduler for MemoryScheduler {
    async fn enqueue(&self, queue: &str, kind: &str, payload: Value, delay_ms: i64) -> Result<()> {
        self.tasks.write().push(ScheduledTask {
            queue: queue.to_string(),
            kind: kind.to_string(),
            payload,
            delay_ms,
        });
        Ok(())
    }

    /// Drains every recorded task for `queue` — delays are treated as elapsed.
    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<QueuedTask>> {
        let mut tasks = self.tasks.write();
        let mut claimed = Vec::new();
        let mut remaining = Vec::new();
        for task in tasks.drain(..) {
            if task.queue == queue && claimed.len() < limit {
                claimed.push(QueuedTask {
                    kind: task.kind,
                    payload: task.payload,
                });
            } else {
                remaining.push(task);
            }
        }
        *tasks = remaining;
        Ok(claimed)
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDocumentStore {
    trajectories: RwLock<Vec<TrajectoryDoc>>,
    orderbooks: RwLock<HashMap<String, OrderbookDoc>>,
}

impl MemoryDocumentStore {
    pub fn trajectories(&self) -> Vec<TrajectoryDoc> {
        self.trajectories.read().clone()
    }

    pub fn orderbook(&self, signal_id: &str) -> Option<OrderbookDoc> {
        self.orderbooks.read().get(signal_id).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put_trajectory(&self, doc: &TrajectoryDoc) -> Result<()> {
        self.trajectories.write().push(doc.clone());
        Ok(())
    }

    async fn upsert_orderbook(
        &self,
        signal_id: &str,
        symbol: &str,
        snapshot: OrderbookSnapshot,
    ) -> Result<()> {
        let mut books = self.orderbooks.write();
        let doc = books
            .entry(signal_id.to_string())
            .or_insert_with(|| OrderbookDoc {
                signal_id: signal_id.to_string(),
                symbol: symbol.to_string(),
                snapshots: Vec::new(),
            });
        doc.symbol = symbol.to_string();
        doc.snapshots.push(snapshot);
        Ok(())
    }
}
