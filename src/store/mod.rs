// =============================================================================
// Store seams — tape, documents, and the delayed-task queue
// =============================================================================
//
// The engine core never talks to a concrete store. These traits are the only
// surface the dispatch stage and the follow-up workers depend on, so tests
// run against in-memory implementations and production runs against redis.
// =============================================================================

pub mod redis;

#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::signal::SignalVector;
use crate::tape::SecondBar;
use crate::workers::orderbook::OrderbookSnapshot;
use crate::workers::trajectory::TrajectoryDoc;

/// A delayed task claimed from a queue.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub kind: String,
    pub payload: Value,
}

/// Sorted, time-indexed persistence for second bars.
///
/// Bars are scored by unix second and namespaced per pair; the writer is the
/// dispatch stage, the readers are trajectory workers. Last write wins per
/// `(pair, second)`.
#[async_trait]
pub trait TapeStore: Send + Sync {
    /// Write one bar, refreshing the pair key's retention window.
    async fn put_bar(&self, pair: &str, bar: &SecondBar) -> Result<()>;

    /// Every bar with `ts_sec ∈ [start_sec, end_sec]`, ascending.
    async fn get_bars(&self, pair: &str, start_sec: i64, end_sec: i64) -> Result<Vec<SecondBar>>;
}

/// Durable destination for emitted signal vectors.
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Persist the vector exactly once and return its assigned id.
    async fn persist(&self, vector: &SignalVector) -> Result<String>;
}

/// Delayed-task queue: durable between enqueue and first claim only.
///
/// A claimed task is removed regardless of handler outcome
/// (remove-on-complete and remove-on-fail).
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn enqueue(&self, queue: &str, kind: &str, payload: Value, delay_ms: i64) -> Result<()>;

    /// Claim up to `limit` tasks whose dispatch time has passed.
    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<QueuedTask>>;
}

/// Document store for follow-up results.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put_trajectory(&self, doc: &TrajectoryDoc) -> Result<()>;

    /// Create the orderbook document for `signal_id` if absent, then append
    /// one snapshot to its `snapshots` array.
    async fn upsert_orderbook(
        &self,
        signal_id: &str,
        symbol: &str,
        snapshot: OrderbookSnapshot,
    ) -> Result<()>;
}
