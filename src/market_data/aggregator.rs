use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::market_data::timeframe::{bucket_start, Timeframe};
use crate::types::{CandleRecord, Trade};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// The open OHLC aggregate for one `(symbol, timeframe)` window.
///
/// `bucket_start` and `open` are fixed at creation; `high`, `low` and `close`
/// move with every trade that lands in the same window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub trade_count: u64,
}

impl Bucket {
    fn open_at(trade: &Trade, timeframe: Timeframe, bucket_start: i64) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            timeframe,
            bucket_start,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            trade_count: 1,
        }
    }

    fn apply(&mut self, price: Decimal) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.trade_count += 1;
    }

    /// Freeze this bucket into the record handed to the store.
    pub fn to_record(&self) -> CandleRecord {
        CandleRecord {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            bucket_start: self.bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// A trade whose window is older than the bucket currently open for that
/// timeframe. It is not folded into any window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateTrade {
    pub timeframe: Timeframe,
    pub trade_bucket: i64,
    pub open_bucket: i64,
}

/// Everything one trade did to the table.
#[derive(Debug, Default)]
pub struct TradeOutcome {
    /// Snapshot of the open bucket for every timeframe after the trade.
    pub live: Vec<Bucket>,
    /// Buckets closed by this trade, ready to persist.
    pub closed: Vec<CandleRecord>,
    /// Timeframes for which the trade arrived too late to count.
    pub late: Vec<LateTrade>,
}

/// Open buckets for one symbol, indexed by [`Timeframe::index`].
#[derive(Debug, Default)]
struct SymbolBuckets {
    slots: [Option<Bucket>; 4],
}

// ---------------------------------------------------------------------------
// CandleAggregator -- per-symbol locked table of open buckets
// ---------------------------------------------------------------------------

/// Table of open buckets keyed by `(symbol, timeframe)`.
///
/// The outer map is only write-locked the first time a symbol shows up. Each
/// symbol then has its own mutex, so trades for different symbols never
/// contend and the four timeframes of one symbol move together. No lock is
/// ever held across I/O.
#[derive(Default)]
pub struct CandleAggregator {
    symbols: RwLock<HashMap<String, Arc<Mutex<SymbolBuckets>>>>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, symbol: &str) -> Arc<Mutex<SymbolBuckets>> {
        if let Some(entry) = self.symbols.read().get(symbol) {
            return entry.clone();
        }
        self.symbols
            .write()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Apply one trade to all four timeframes of its symbol.
    pub fn apply(&self, trade: &Trade) -> TradeOutcome {
        let entry = self.entry(&trade.symbol);
        let mut buckets = entry.lock();
        let mut outcome = TradeOutcome::default();

        for tf in Timeframe::ALL {
            let start = bucket_start(trade.timestamp, tf);
            let slot = &mut buckets.slots[tf.index()];

            match slot.as_ref().map(|b| b.bucket_start.cmp(&start)) {
                None => *slot = Some(Bucket::open_at(trade, tf, start)),
                Some(Ordering::Equal) => {
                    if let Some(bucket) = slot.as_mut() {
                        bucket.apply(trade.price);
                    }
                }
                Some(Ordering::Less) => {
                    if let Some(prev) = slot.replace(Bucket::open_at(trade, tf, start)) {
                        outcome.closed.push(prev.to_record());
                    }
                }
                Some(Ordering::Greater) => {
                    if let Some(open) = slot.as_ref() {
                        outcome.late.push(LateTrade {
                            timeframe: tf,
                            trade_bucket: start,
                            open_bucket: open.bucket_start,
                        });
                    }
                }
            }

            if let Some(bucket) = slot.as_ref() {
                outcome.live.push(bucket.clone());
            }
        }

        outcome
    }

    /// Current open bucket for a key, if any.
    pub fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Option<Bucket> {
        let entry = self.symbols.read().get(symbol).cloned()?;
        let buckets = entry.lock();
        buckets.slots[timeframe.index()].clone()
    }

    /// Symbols that have seen at least one trade.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.symbols.read().keys().cloned().collect();
        out.sort();
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
