// =============================================================================
// Queue worker — claims due delayed tasks and dispatches by kind
// =============================================================================
//
// Claimed tasks are gone from the queue whatever the handler outcome, so a
// handler failure is logged and the task is not retried.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::exchange::client::DepthClient;
use crate::store::{DocumentStore, QueuedTask, TapeStore, TaskScheduler};
use crate::workers::{orderbook, trajectory};

/// Poll cadence for due tasks.
const POLL_INTERVAL_MS: u64 = 500;
/// Maximum tasks claimed per poll.
const CLAIM_BATCH: usize = 16;

/// Shared handles a queue worker needs to run any task kind.
pub struct WorkerContext {
    pub exchange: String,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub docs: Arc<dyn DocumentStore>,
    pub tape: Arc<dyn TapeStore>,
    pub depth: Arc<DepthClient>,
}

/// Poll `queue` until shutdown, handling every claimed task.
pub async fn run_queue_worker(ctx: WorkerContext, queue: String, mut shutdown: watch::Receiver<bool>) {
    info!(queue = %queue, "queue worker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
            _ = shutdown.changed() => break,
        }

        match ctx.scheduler.claim_due(&queue, CLAIM_BATCH).await {
            Ok(tasks) => {
                for task in tasks {
                    handle_task(&ctx, task).await;
                }
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "claiming due tasks failed");
            }
        }
    }
    info!(queue = %queue, "queue worker stopped");
}

async fn handle_task(ctx: &WorkerContext, task: QueuedTask) {
    let orderbook_kind = format!("{}_orderbook", ctx.exchange);
    let trajectory_kind = format!("{}_price", ctx.exchange);

    if task.kind == orderbook_kind {
        match serde_json::from_value::<orderbook::OrderbookTask>(task.payload) {
            Ok(parsed) => {
                let now_ms = Utc::now().timestamp_millis();
                if let Err(e) =
                    orderbook::handle(&ctx.depth, ctx.docs.as_ref(), parsed, now_ms).await
                {
                    warn!(error = %e, "orderbook task failed — discarded");
                }
            }
            Err(e) => warn!(error = %e, "malformed orderbook task payload"),
        }
    } else if task.kind == trajectory_kind {
        match serde_json::from_value::<trajectory::TrajectoryTask>(task.payload) {
            Ok(parsed) => {
                if let Err(e) =
                    trajectory::handle(ctx.tape.as_ref(), ctx.docs.as_ref(), &ctx.exchange, parsed)
                        .await
                {
                    warn!(error = %e, "trajectory task failed — discarded");
                }
            }
            Err(e) => warn!(error = %e, "malformed trajectory task payload"),
        }
    } else {
        warn!(kind = %task.kind, "unknown task kind — discarded");
    }
}
