// =============================================================================
// Canonical market events — combined-stream envelope parsing
// =============================================================================
//
// The transport delivers every frame as `{ "stream": "<symbol_lc>@<kind>",
// "data": { ... } }`. The stream prefix up to the first `@` is the symbol;
// the suffix selects the variant. Unknown suffixes and payloads with missing
// or non-finite numeric fields are dropped.
// =============================================================================

use serde_json::Value;

/// One canonical event delivered to the dispatch stage.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    AggTrade {
        symbol: String,
        price: f64,
        qty: f64,
        event_time_ms: i64,
        buyer_is_maker: bool,
    },
    Ticker {
        symbol: String,
        quote_volume_24h: f64,
        change_pct_24h: f64,
        high_24h: f64,
        low_24h: f64,
        last: f64,
    },
    BookTicker {
        symbol: String,
        best_bid: f64,
        best_ask: f64,
    },
    Depth5 {
        symbol: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::AggTrade { symbol, .. }
            | MarketEvent::Ticker { symbol, .. }
            | MarketEvent::BookTicker { symbol, .. }
            | MarketEvent::Depth5 { symbol, .. } => symbol,
        }
    }
}

/// Parse one combined-stream frame into a canonical event.
///
/// Returns `None` for unknown streams and for payloads that fail the
/// numeric invariants (finite, strictly positive prices and quantities,
/// ask > bid when both sides are quoted).
pub fn parse_event(text: &str) -> Option<MarketEvent> {
    let root: Value = serde_json::from_str(text).ok()?;
    let stream = root.get("stream")?.as_str()?;
    let data = root.get("data")?;

    let (prefix, suffix) = stream.split_once('@')?;
    let symbol = prefix.to_uppercase();

    match suffix {
        "aggTrade" => parse_agg_trade(symbol, data),
        "ticker" => parse_ticker(symbol, data),
        "bookTicker" => parse_book_ticker(symbol, data),
        "depth5@100ms" => parse_depth5(symbol, data),
        _ => None,
    }
}

fn parse_agg_trade(symbol: String, data: &Value) -> Option<MarketEvent> {
    let price = num_field(data, "p")?;
    let qty = num_field(data, "q")?;
    let event_time_ms = data.get("E")?.as_i64()?;
    let buyer_is_maker = data.get("m")?.as_bool()?;

    if price <= 0.0 || qty <= 0.0 {
        return None;
    }

    Some(MarketEvent::AggTrade {
        symbol,
        price,
        qty,
        event_time_ms,
        buyer_is_maker,
    })
}

fn parse_ticker(symbol: String, data: &Value) -> Option<MarketEvent> {
    let quote_volume_24h = num_field(data, "q")?;
    let change_pct_24h = num_field(data, "P")?;
    let high_24h = num_field(data, "h")?;
    let low_24h = num_field(data, "l")?;
    let last = num_field(data, "c")?;

    if quote_volume_24h < 0.0 || high_24h <= 0.0 || low_24h <= 0.0 || last <= 0.0 {
        return None;
    }

    Some(MarketEvent::Ticker {
        symbol,
        quote_volume_24h,
        change_pct_24h,
        high_24h,
        low_24h,
        last,
    })
}

fn parse_book_ticker(symbol: String, data: &Value) -> Option<MarketEvent> {
    let best_bid = num_field(data, "b")?;
    let best_ask = num_field(data, "a")?;

    // Crossed or degenerate quotes never reach the monitor.
    if best_bid > 0.0 && best_ask > 0.0 && best_ask <= best_bid {
        return None;
    }

    Some(MarketEvent::BookTicker {
        symbol,
        best_bid,
        best_ask,
    })
}

fn parse_depth5(symbol: String, data: &Value) -> Option<MarketEvent> {
    let bids = parse_levels(data.get("bids")?)?;
    let asks = parse_levels(data.get("asks")?)?;

    if bids.is_empty() || asks.is_empty() {
        return None;
    }

    Some(MarketEvent::Depth5 {
        symbol,
        bids,
        asks,
    })
}

/// Parse up to five `[price, qty]` levels, each serialised as JSON strings.
fn parse_levels(value: &Value) -> Option<Vec<(f64, f64)>> {
    let arr = value.as_array()?;
    let mut levels = Vec::with_capacity(5);
    for entry in arr.iter().take(5) {
        let price = num_value(entry.get(0)?)?;
        let qty = num_value(entry.get(1)?)?;
        if price <= 0.0 || qty < 0.0 {
            return None;
        }
        levels.push((price, qty));
    }
    Some(levels)
}

/// The exchange sends numerics as JSON strings; accept plain numbers too.
fn num_field(data: &Value, key: &str) -> Option<f64> {
    num_value(data.get(key)?)
}

fn num_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::String(s) => s.parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agg_trade_frame() {
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": { "p": "37000.50", "q": "0.125", "E": 1700000000123, "m": false }
        }"#;
        let ev = parse_event(json).expect("should parse");
        match ev {
            MarketEvent::AggTrade {
                symbol,
                price,
                qty,
                event_time_ms,
                buyer_is_maker,
            } => {
                assert_eq!(symbol, "BTCUSDT");
                assert!((price - 37000.50).abs() < 1e-9);
                assert!((qty - 0.125).abs() < 1e-9);
                assert_eq!(event_time_ms, 1700000000123);
                assert!(!buyer_is_maker);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_ticker_frame() {
        let json = r#"{
            "stream": "solusdt@ticker",
            "data": { "q": "5000000.0", "P": "2.5134", "h": "110.0", "l": "100.0", "c": "105.5" }
        }"#;
        let ev = parse_event(json).expect("should parse");
        match ev {
            MarketEvent::Ticker {
                symbol,
                quote_volume_24h,
                change_pct_24h,
                ..
            } => {
                assert_eq!(symbol, "SOLUSDT");
                assert!((quote_volume_24h - 5_000_000.0).abs() < 1e-9);
                assert!((change_pct_24h - 2.5134).abs() < 1e-9);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_book_ticker_frame() {
        let json = r#"{
            "stream": "ethusdt@bookTicker",
            "data": { "b": "2000.10", "a": "2000.20" }
        }"#;
        let ev = parse_event(json).expect("should parse");
        assert_eq!(ev.symbol(), "ETHUSDT");
    }

    #[test]
    fn parse_depth_frame() {
        let json = r#"{
            "stream": "btcusdt@depth5@100ms",
            "data": {
                "bids": [["100.0","1.0"],["99.9","2.0"],["99.8","3.0"],["99.7","4.0"],["99.6","5.0"]],
                "asks": [["100.1","1.5"],["100.2","2.5"],["100.3","3.5"],["100.4","4.5"],["100.5","5.5"]]
            }
        }"#;
        let ev = parse_event(json).expect("should parse");
        match ev {
            MarketEvent::Depth5 { bids, asks, .. } => {
                assert_eq!(bids.len(), 5);
                assert_eq!(asks.len(), 5);
                assert!((bids[0].0 - 100.0).abs() < 1e-9);
                assert!((asks[4].1 - 5.5).abs() < 1e-9);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_stream_is_dropped() {
        let json = r#"{ "stream": "btcusdt@kline_1m", "data": {} }"#;
        assert!(parse_event(json).is_none());
    }

    #[test]
    fn missing_field_is_dropped() {
        let json = r#"{ "stream": "btcusdt@aggTrade", "data": { "p": "100.0" } }"#;
        assert!(parse_event(json).is_none());
    }

    #[test]
    fn non_finite_is_dropped() {
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": { "p": "NaN", "q": "0.1", "E": 1, "m": true }
        }"#;
        assert!(parse_event(json).is_none());
    }

    #[test]
    fn non_positive_trade_is_dropped() {
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": { "p": "0.0", "q": "0.1", "E": 1, "m": true }
        }"#;
        assert!(parse_event(json).is_none());
    }

    #[test]
    fn crossed_book_is_dropped() {
        let json = r#"{
            "stream": "ethusdt@bookTicker",
            "data": { "b": "2000.30", "a": "2000.20" }
        }"#;
        assert!(parse_event(json).is_none());
    }
}
