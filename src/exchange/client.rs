// =============================================================================
// Exchange REST client — public depth snapshots with retry
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Retry schedule: 3 attempts, doubling backoff from 500 ms.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Top-5 depth levels, best first, as `(price, qty)`.
#[derive(Debug, Clone)]
pub struct DepthLevels {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Thin client for the exchange's public REST endpoints.
#[derive(Clone)]
pub struct DepthClient {
    base_url: String,
    client: reqwest::Client,
}

impl DepthClient {
    pub fn new() -> Self {
        Self::with_base_url("https://api.binance.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// GET /api/v3/depth?limit=5 with retry and doubling backoff.
    #[instrument(skip(self), name = "exchange::get_depth5")]
    pub async fn get_depth5(&self, symbol: &str) -> Result<DepthLevels> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit=5",
            self.base_url,
            symbol.to_uppercase()
        );

        let mut backoff_ms = BACKOFF_BASE_MS;
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch_depth(&url).await {
                Ok(levels) => {
                    debug!(symbol = %symbol, attempt, "depth snapshot retrieved");
                    return Ok(levels);
                }
                Err(e) => {
                    warn!(symbol = %symbol, attempt, error = %e, "depth snapshot attempt failed");
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms *= 2;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("depth snapshot failed")))
    }

    async fn fetch_depth(&self, url: &str) -> Result<DepthLevels> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("GET /api/v3/depth request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse depth response")?;

        if !status.is_success() {
            anyhow::bail!("GET /api/v3/depth returned {status}: {body}");
        }

        Ok(DepthLevels {
            bids: parse_levels(&body["bids"]).context("depth response missing bids")?,
            asks: parse_levels(&body["asks"]).context("depth response missing asks")?,
        })
    }
}

impl Default for DepthClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The exchange sends levels as `[["price", "qty"], ...]` string pairs.
fn parse_levels(value: &Value) -> Option<Vec<(f64, f64)>> {
    let arr = value.as_array()?;
    let mut levels = Vec::with_capacity(5);
    for entry in arr.iter().take(5) {
        let price: f64 = entry.get(0)?.as_str()?.parse().ok()?;
        let qty: f64 = entry.get(1)?.as_str()?.parse().ok()?;
        levels.push((price, qty));
    }
    Some(levels)
}
