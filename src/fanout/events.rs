use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market_data::{Bucket, Timeframe};
use crate::types::{CandleRecord, Trade};

/// Outbound event, tagged on the wire by `type`.
///
/// ```json
/// { "type": "live-trade", "symbol": "BTCUSDT", "price": 100.5, "quantity": 0.2, "timestamp": 1700000000000 }
/// { "type": "candle-update", "time": 1699999980000, "symbol": "BTCUSDT", "timeframe": "1m",
///   "open": 100.0, "high": 101.0, "low": 99.5, "close": 100.5 }
/// ```
///
/// Consumers treat `candle-update` as state keyed by
/// `(symbol, timeframe, time)`: the last value received wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FeedEvent {
    LiveTrade(LiveTrade),
    CandleUpdate(CandleUpdate),
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::LiveTrade(t) => &t.symbol,
            Self::CandleUpdate(c) => &c.symbol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTrade {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    /// Bucket start in milliseconds since the Unix epoch.
    pub time: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
}

impl From<&Trade> for FeedEvent {
    fn from(t: &Trade) -> Self {
        Self::LiveTrade(LiveTrade {
            symbol: t.symbol.clone(),
            price: t.price,
            quantity: t.quantity,
            timestamp: t.timestamp,
        })
    }
}

impl From<&Bucket> for FeedEvent {
    fn from(b: &Bucket) -> Self {
        Self::CandleUpdate(CandleUpdate {
            time: b.bucket_start,
            symbol: b.symbol.clone(),
            timeframe: b.timeframe,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
        })
    }
}

impl From<&CandleRecord> for FeedEvent {
    fn from(r: &CandleRecord) -> Self {
        Self::CandleUpdate(CandleUpdate {
            time: r.bucket_start,
            symbol: r.symbol.clone(),
            timeframe: r.timeframe,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn live_trade_wire_shape() {
        let trade = Trade::new("BTCUSDT", dec!(100.5), dec!(0.25), 1_700_000_000_000).unwrap();
        let v = serde_json::to_value(FeedEvent::from(&trade)).unwrap();
        assert_eq!(v["type"], "live-trade");
        assert_eq!(v["symbol"], "BTCUSDT");
        assert_eq!(v["price"].as_f64(), Some(100.5));
        assert_eq!(v["quantity"].as_f64(), Some(0.25));
        assert_eq!(v["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn candle_update_wire_shape() {
        let rec = CandleRecord {
            symbol: "ETHUSDT".into(),
            timeframe: Timeframe::S30,
            bucket_start: 30_000,
            open: dec!(10),
            high: dec!(12),
            low: dec!(9),
            close: dec!(11),
        };
        let event = FeedEvent::from(&rec);
        assert_eq!(event.symbol(), "ETHUSDT");

        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "candle-update");
        assert_eq!(v["time"], 30_000);
        assert_eq!(v["timeframe"], "30s");
        assert_eq!(v["high"].as_f64(), Some(12.0));
    }

    #[test]
    fn parses_tagged_payload() {
        let json = r#"{"type":"candle-update","time":60000,"symbol":"SOLUSDT","timeframe":"1m",
                       "open":1.5,"high":2.0,"low":1.0,"close":1.75}"#;
        match serde_json::from_str::<FeedEvent>(json).unwrap() {
            FeedEvent::CandleUpdate(c) => {
                assert_eq!(c.timeframe, Timeframe::M1);
                assert_eq!(c.close, dec!(1.75));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
