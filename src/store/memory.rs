use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::market_data::Timeframe;
use crate::store::CandleStore;
use crate::types::CandleRecord;

type Partition = HashMap<String, BTreeMap<i64, CandleRecord>>;

/// Process-local store, one partition per timeframe. Used when no database
/// path is configured and as the reference store in tests.
#[derive(Default)]
pub struct InMemoryCandleStore {
    partitions: [RwLock<Partition>; 4],
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows held for one timeframe.
    pub fn len(&self, timeframe: Timeframe) -> usize {
        self.partitions[timeframe.index()]
            .read()
            .values()
            .map(BTreeMap::len)
            .sum()
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn persist(&self, record: &CandleRecord) -> Result<(), StoreError> {
        self.partitions[record.timeframe.index()]
            .write()
            .entry(record.symbol.clone())
            .or_default()
            .insert(record.bucket_start, record.clone());
        Ok(())
    }

    async fn recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<CandleRecord>, StoreError> {
        let partition = self.partitions[timeframe.index()].read();
        Ok(partition
            .get(symbol)
            .map(|rows| rows.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<CandleRecord>, StoreError> {
        let partition = self.partitions[timeframe.index()].read();
        Ok(partition
            .get(symbol)
            .and_then(|rows| rows.values().next_back().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn record(tf: Timeframe, start: i64, close: Decimal) -> CandleRecord {
        CandleRecord {
            symbol: "BTCUSDT".into(),
            timeframe: tf,
            bucket_start: start,
            open: dec!(100),
            high: close.max(dec!(100)),
            low: close.min(dec!(100)),
            close,
        }
    }

    #[tokio::test]
    async fn persist_is_idempotent_last_write_wins() {
        let store = InMemoryCandleStore::new();
        store.persist(&record(Timeframe::M1, 0, dec!(101))).await.unwrap();
        store.persist(&record(Timeframe::M1, 0, dec!(99))).await.unwrap();

        assert_eq!(store.len(Timeframe::M1), 1);
        let latest = store.latest("BTCUSDT", Timeframe::M1).await.unwrap().unwrap();
        assert_eq!(latest.close, dec!(99));
        assert_eq!(latest.low, dec!(99));
    }

    #[tokio::test]
    async fn records_route_to_their_timeframe() {
        let store = InMemoryCandleStore::new();
        store.persist(&record(Timeframe::S30, 0, dec!(1))).await.unwrap();
        store.persist(&record(Timeframe::H1, 0, dec!(2))).await.unwrap();

        assert_eq!(store.len(Timeframe::S30), 1);
        assert_eq!(store.len(Timeframe::H1), 1);
        assert_eq!(store.len(Timeframe::M5), 0);
        assert!(store.latest("BTCUSDT", Timeframe::M5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let store = InMemoryCandleStore::new();
        for i in 0..5 {
            store
                .persist(&record(Timeframe::S30, i * 30_000, dec!(100)))
                .await
                .unwrap();
        }
        let rows = store.recent("BTCUSDT", Timeframe::S30, 3).await.unwrap();
        let starts: Vec<i64> = rows.iter().map(|r| r.bucket_start).collect();
        assert_eq!(starts, vec![120_000, 90_000, 60_000]);
        assert!(store.recent("BTCUSDT", Timeframe::S30, 0).await.unwrap().is_empty());
        assert!(store.recent("ETHUSDT", Timeframe::S30, 3).await.unwrap().is_empty());
    }
}
