// =============================================================================
// Redis store — tape, documents, and the delayed-task queue
// =============================================================================
//
// Layouts:
//   <exchange>:tape:<pair>       sorted set, score = unix second,
//                                member = "<second>:<o,h,l,c,v>" (the second
//                                prefix keeps equal flat bars distinct);
//                                TTL refreshed to 45 days on every write
//   <exchange>:signal:<id>       JSON signal vector
//   <exchange>:trajectory:<id>   JSON trajectory document
//   <exchange>:orderbook:<id>    JSON orderbook document (read-modify-write)
//   queue:<name>                 sorted set, score = dispatch time (ms),
//                                member = "<uuid>:<task json>"
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::TAPE_TTL_DAYS;
use crate::signal::SignalVector;
use crate::tape::{decode_bar, encode_bar, SecondBar};
use crate::workers::orderbook::{OrderbookDoc, OrderbookSnapshot};
use crate::workers::trajectory::TrajectoryDoc;

use super::{DocumentStore, QueuedTask, SignalSink, TapeStore, TaskScheduler};

pub struct RedisStore {
    conn: ConnectionManager,
    exchange: String,
}

impl RedisStore {
    /// Open a managed connection to `url`.
    pub async fn connect(url: &str, exchange: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        info!(url = %url, "redis store connected");
        Ok(Self {
            conn,
            exchange: exchange.into(),
        })
    }

    fn tape_key(&self, pair: &str) -> String {
        format!("{}:tape:{}", self.exchange, pair)
    }

    fn signal_key(&self, id: &str) -> String {
        format!("{}:signal:{}", self.exchange, id)
    }

    fn trajectory_key(&self, id: &str) -> String {
        format!("{}:trajectory:{}", self.exchange, id)
    }

    fn orderbook_key(&self, id: &str) -> String {
        format!("{}:orderbook:{}", self.exchange, id)
    }

    fn queue_key(queue: &str) -> String {
        format!("queue:{queue}")
    }
}

#[async_trait]
impl TapeStore for RedisStore {
    async fn put_bar(&self, pair: &str, bar: &SecondBar) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.tape_key(pair);
        let member = format!("{}:{}", bar.ts_sec, encode_bar(bar));

        // Last write wins per (pair, second).
        let _: () = conn
            .zrembyscore(&key, bar.ts_sec, bar.ts_sec)
            .await
            .context("tape ZREMRANGEBYSCORE failed")?;
        let _: () = conn
            .zadd(&key, member, bar.ts_sec)
            .await
            .context("tape ZADD failed")?;
        let _: () = conn
            .expire(&key, TAPE_TTL_DAYS * 86_400)
            .await
            .context("tape EXPIRE failed")?;
        Ok(())
    }

    async fn get_bars(&self, pair: &str, start_sec: i64, end_sec: i64) -> Result<Vec<SecondBar>> {
        let mut conn = self.conn.clone();
        let key = self.tape_key(pair);
        let members: Vec<String> = conn
            .zrangebyscore(&key, start_sec, end_sec)
            .await
            .context("tape ZRANGEBYSCORE failed")?;

        members
            .iter()
            .map(|member| {
                let (ts, csv) = member
                    .split_once(':')
                    .context("malformed tape member (no second prefix)")?;
                let ts_sec: i64 = ts.parse().context("malformed tape member second")?;
                decode_bar(ts_sec, csv)
            })
            .collect()
    }
}

#[async_trait]
impl SignalSink for RedisStore {
    async fn persist(&self, vector: &SignalVector) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(vector).context("failed to serialise signal vector")?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .set(self.signal_key(&id), body)
            .await
            .context("signal SET failed")?;
        Ok(id)
    }
}

#[async_trait]
impl TaskScheduler for RedisStore {
    async fn enqueue(&self, queue: &str, kind: &str, payload: Value, delay_ms: i64) -> Result<()> {
        let dispatch_at_ms = Utc::now().timestamp_millis() + delay_ms;
        let body = serde_json::to_string(&json!({ "kind": kind, "payload": payload }))
            .context("failed to serialise task")?;
        // Unique member per enqueue: sibling tasks may carry identical bodies.
        let member = format!("{}:{}", Uuid::new_v4(), body);

        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(Self::queue_key(queue), member, dispatch_at_ms)
            .await
            .context("queue ZADD failed")?;
        Ok(())
    }

    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<QueuedTask>> {
        let now_ms = Utc::now().timestamp_millis();
        let key = Self::queue_key(queue);

        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(&key, "-inf", now_ms, 0, limit as isize)
            .await
            .context("queue ZRANGEBYSCORE failed")?;

        let mut claimed = Vec::new();
        for member in members {
            // ZREM doubles as the claim: whoever removes the member owns it.
            let removed: i64 = conn
                .zrem(&key, &member)
                .await
                .context("queue ZREM failed")?;
            if removed == 0 {
                continue;
            }

            let Some((_, body)) = member.split_once(':') else {
                continue;
            };
            let parsed: Value = match serde_json::from_str(body) {
                Ok(v) => v,
                Err(_) => continue,
            };
            claimed.push(QueuedTask {
                kind: parsed["kind"].as_str().unwrap_or_default().to_string(),
                payload: parsed["payload"].clone(),
            });
        }
        Ok(claimed)
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn put_trajectory(&self, doc: &TrajectoryDoc) -> Result<()> {
        let body = serde_json::to_string(doc).context("failed to serialise trajectory")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(self.trajectory_key(&doc.signal_id), body)
            .await
            .context("trajectory SET failed")?;
        Ok(())
    }

    async fn upsert_orderbook(
        &self,
        signal_id: &str,
        symbol: &str,
        snapshot: OrderbookSnapshot,
    ) -> Result<()> {
        let key = self.orderbook_key(signal_id);
        let mut conn = self.conn.clone();

        let existing: Option<String> = conn
            .get(&key)
            .await
            .context("orderbook GET failed")?;

        let mut doc = match existing {
            Some(body) => serde_json::from_str::<OrderbookDoc>(&body)
                .context("stored orderbook document is malformed")?,
            None => OrderbookDoc {
                signal_id: signal_id.to_string(),
                symbol: symbol.to_string(),
                snapshots: Vec::new(),
            },
        };
        doc.symbol = symbol.to_string();
        doc.snapshots.push(snapshot);

        let body = serde_json::to_string(&doc).context("failed to serialise orderbook")?;
        let _: () = conn
            .set(&key, body)
            .await
            .context("orderbook SET failed")?;
        Ok(())
    }
}
