// =============================================================================
// Trajectory worker — post-signal price path capture
// =============================================================================
//
// Runs ~31 minutes after an emission. Reads the 30-minute second-bar window
// that starts at the trigger, resamples it onto a fixed offset grid, and
// persists the realised sigma together with the sampled path. An empty window
// still persists (with nulls) so the labelling job can tell "no data" apart
// from "job never ran".
// =============================================================================

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::monitor::population_stddev;
use crate::signal::normalize_symbol;
use crate::store::{DocumentStore, TapeStore};
use crate::tape::SecondBar;

/// Width of the captured window (ms).
const TRAJECTORY_WINDOW_MS: i64 = 30 * 60 * 1_000;

/// Payload of a `<exchange>_price` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryTask {
    pub id: String,
    pub symbol: String,
    /// Emission time (ms) — the window start.
    pub timestamp: i64,
}

/// One resampled point on the offset grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryPoint {
    pub t_offset_sec: i64,
    pub price: Option<f64>,
    pub volume: f64,
}

/// The persisted trajectory document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryDoc {
    pub signal_id: String,
    pub symbol: String,
    pub exchange: String,
    #[serde(rename = "sigma30m")]
    pub sigma_30m: Option<f64>,
    pub prices: Vec<TrajectoryPoint>,
}

/// Dense for the first 30 seconds, then 45 s, then a 30 s stride out to the
/// end of the window.
pub fn offset_grid() -> Vec<i64> {
    let mut grid: Vec<i64> = (1..=30).collect();
    grid.push(45);
    grid.extend((60..=1800).step_by(30).map(|s| s as i64));
    grid
}

/// Process one trajectory task end to end.
pub async fn handle(
    tape: &dyn TapeStore,
    docs: &dyn DocumentStore,
    exchange: &str,
    task: TrajectoryTask,
) -> Result<()> {
    let start_ms = task.timestamp;
    let end_ms = start_ms + TRAJECTORY_WINDOW_MS - 1_000;

    let bars = tape
        .get_bars(
            &task.symbol,
            start_ms.div_euclid(1_000),
            end_ms.div_euclid(1_000),
        )
        .await?;

    if bars.is_empty() {
        warn!(
            signal_id = %task.id,
            symbol = %task.symbol,
            "no second bars in the trajectory window"
        );
    }

    let doc = TrajectoryDoc {
        signal_id: task.id,
        symbol: normalize_symbol(&task.symbol),
        exchange: exchange.to_string(),
        sigma_30m: realised_sigma(&bars),
        prices: resample(&bars, start_ms),
    };

    docs.put_trajectory(&doc).await?;
    info!(
        signal_id = %doc.signal_id,
        symbol = %doc.symbol,
        bars = bars.len(),
        "trajectory captured"
    );
    Ok(())
}

/// Population stddev of consecutive-close log returns; `None` under 2 returns.
fn realised_sigma(bars: &[SecondBar]) -> Option<f64> {
    let returns: Vec<f64> = bars
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| (w[1].close / w[0].close).ln())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    Some(population_stddev(returns.iter()))
}

/// For each grid offset, the first bar at or after `start + offset`; falls
/// back to the last available bar past the end of the data.
fn resample(bars: &[SecondBar], start_ms: i64) -> Vec<TrajectoryPoint> {
    offset_grid()
        .into_iter()
        .map(|offset_sec| {
            // First second fully at or after the target instant.
            let target_sec = (start_ms + offset_sec * 1_000 + 999).div_euclid(1_000);
            let bar = bars
                .iter()
                .find(|b| b.ts_sec >= target_sec)
                .or_else(|| bars.last());
            TrajectoryPoint {
                t_offset_sec: offset_sec,
                price: bar.map(|b| b.close),
                volume: bar.map(|b| b.volume).unwrap_or(0.0),
            }
        })
        .collect()
}
