// =============================================================================
// Candle Engine: trade → aggregate → persist + push
// =============================================================================
//
// The aggregator lock is held only for the in-memory transition. Closed
// candles are handed to the background writer without waiting, then live
// state is pushed under the publish timeout. A stalled store therefore never
// holds up the next trade; failures on either side are counted and logged.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::fanout::{LivePublisher, PublishTally};
use crate::market_data::{CandleAggregator, TradeOutcome};
use crate::runtime_config::RuntimeConfig;
use crate::store::{CandleStore, CandleWriter, PersistPolicy};
use crate::types::Trade;

/// Timeouts, retry policy and queue depth for the persistence side.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub persist_timeout: Duration,
    pub persist_retries: u32,
    pub persist_backoff: Duration,
    pub persist_queue: usize,
}

impl EngineSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            persist_timeout: config.persist_timeout(),
            persist_retries: config.persist_retries,
            persist_backoff: config.persist_backoff(),
            persist_queue: config.persist_queue,
        }
    }

    fn policy(&self) -> PersistPolicy {
        PersistPolicy {
            timeout: self.persist_timeout,
            retries: self.persist_retries,
            backoff: self.persist_backoff,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Lock-free counters exposed on the health endpoint.
#[derive(Default)]
struct EngineStats {
    trades: AtomicU64,
    malformed: AtomicU64,
    late_trades: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub trades: u64,
    pub malformed: u64,
    pub late_trades: u64,
    pub closed_candles: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub persist_dropped: u64,
    pub publish_failures: u64,
}

/// What happened to one trade. Persistence of `outcome.closed` continues in
/// the background; `queued` says how many of those the writer accepted.
#[derive(Debug)]
pub struct IngestReport {
    pub outcome: TradeOutcome,
    pub queued: usize,
    pub publish: PublishTally,
}

pub struct CandleEngine {
    aggregator: CandleAggregator,
    store: Arc<dyn CandleStore>,
    writer: CandleWriter,
    publisher: Arc<LivePublisher>,
    stats: EngineStats,
}

impl CandleEngine {
    /// Build the engine and start its persistence writer. Must be called
    /// inside a tokio runtime.
    pub fn new(
        store: Arc<dyn CandleStore>,
        publisher: Arc<LivePublisher>,
        settings: EngineSettings,
    ) -> Self {
        let writer = CandleWriter::spawn(store.clone(), settings.policy(), settings.persist_queue);
        Self {
            aggregator: CandleAggregator::new(),
            store,
            writer,
            publisher,
            stats: EngineStats::default(),
        }
    }

    pub fn aggregator(&self) -> &CandleAggregator {
        &self.aggregator
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    /// Process one decoded trade: aggregate, queue closed candles, push.
    pub async fn ingest(&self, trade: Trade) -> IngestReport {
        let outcome = self.aggregator.apply(&trade);

        self.stats.trades.fetch_add(1, Ordering::Relaxed);
        self.stats
            .closed
            .fetch_add(outcome.closed.len() as u64, Ordering::Relaxed);
        for late in &outcome.late {
            self.stats.late_trades.fetch_add(1, Ordering::Relaxed);
            debug!(
                symbol = %trade.symbol,
                timeframe = %late.timeframe,
                trade_bucket = late.trade_bucket,
                open_bucket = late.open_bucket,
                "late trade skipped for timeframe"
            );
        }

        let queued = outcome
            .closed
            .iter()
            .filter(|&record| self.writer.submit(record.clone()))
            .count();
        let publish = self.publisher.push(&trade, &outcome.live).await;

        IngestReport {
            outcome,
            queued,
            publish,
        }
    }

    pub fn record_malformed(&self, err: &IngestError) {
        self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(error = %err, "dropping inbound trade");
    }

    /// Wait until every closed candle queued so far has been persisted or
    /// given up on.
    #[cfg(test)]
    pub async fn flush_persistence(&self) {
        self.writer.flush().await;
    }

    /// Stop accepting closed candles and drain the ones already queued.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            trades: self.stats.trades.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
            late_trades: self.stats.late_trades.load(Ordering::Relaxed),
            closed_candles: self.stats.closed.load(Ordering::Relaxed),
            persisted: self.writer.persisted(),
            persist_failures: self.writer.failures(),
            persist_dropped: self.writer.dropped(),
            publish_failures: self.publisher.failure_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::time::Instant;

    use crate::fanout::publisher::tests::{FailingSink, RecordingSink};
    use crate::fanout::{EventSink, FeedEvent};
    use crate::market_data::trade_stream::parse_trade_event;
    use crate::market_data::Timeframe;
    use crate::store::writer::tests::{FlakyStore, StalledStore};
    use crate::store::InMemoryCandleStore;
    use crate::types::CandleRecord;

    fn settings() -> EngineSettings {
        EngineSettings {
            persist_timeout: Duration::from_millis(100),
            persist_retries: 2,
            persist_backoff: Duration::from_millis(10),
            persist_queue: 64,
        }
    }

    pub(crate) fn engine_with(
        store: Arc<dyn CandleStore>,
        sink: Arc<dyn EventSink>,
    ) -> CandleEngine {
        let publisher = Arc::new(LivePublisher::new(sink, Duration::from_millis(100)));
        CandleEngine::new(store, publisher, settings())
    }

    fn trade(price: Decimal, ts: i64) -> Trade {
        Trade::new("BTCUSDT", price, dec!(0.5), ts).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_scenarios() {
        let store = Arc::new(InMemoryCandleStore::new());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(store.clone(), sink.clone());

        engine.ingest(trade(dec!(100), 0)).await;
        engine.ingest(trade(dec!(110), 10_000)).await;
        let report = engine.ingest(trade(dec!(90), 35_000)).await;
        assert_eq!(report.queued, 1);
        engine.flush_persistence().await;

        // Scenario 1: one closed 30s candle, the next window open.
        let rows = store.recent("BTCUSDT", Timeframe::S30, 10).await.unwrap();
        assert_eq!(
            rows,
            vec![CandleRecord {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::S30,
                bucket_start: 0,
                open: dec!(100),
                high: dec!(110),
                low: dec!(100),
                close: dec!(110),
            }]
        );
        let open = engine.aggregator().snapshot("BTCUSDT", Timeframe::S30).unwrap();
        assert_eq!((open.bucket_start, open.open, open.high, open.low, open.close),
                   (30_000, dec!(90), dec!(90), dec!(90), dec!(90)));

        // Scenario 2: latest is the closed record, open bucket unpersisted.
        let latest = store.latest("BTCUSDT", Timeframe::S30).await.unwrap().unwrap();
        assert_eq!(latest.bucket_start, 0);

        let report = engine.ingest(trade(dec!(95), 40_000)).await;
        assert_eq!(report.queued, 0);
        engine.flush_persistence().await;
        let open = engine.aggregator().snapshot("BTCUSDT", Timeframe::S30).unwrap();
        assert_eq!((open.high, open.low, open.close), (dec!(95), dec!(90), dec!(95)));
        assert_eq!(store.len(Timeframe::S30), 1);

        // Crossing into 60s closes the 30s window and the first minute.
        let report = engine.ingest(trade(dec!(96), 60_000)).await;
        assert_eq!(report.queued, 2);
        engine.flush_persistence().await;
        let latest = store.latest("BTCUSDT", Timeframe::S30).await.unwrap().unwrap();
        assert_eq!((latest.bucket_start, latest.high, latest.close), (30_000, dec!(95), dec!(95)));
        let minute = store.latest("BTCUSDT", Timeframe::M1).await.unwrap().unwrap();
        assert_eq!((minute.open, minute.high, minute.low, minute.close),
                   (dec!(100), dec!(110), dec!(90), dec!(95)));

        let stats = engine.stats();
        assert_eq!(stats.trades, 5);
        assert_eq!(stats.closed_candles, 3);
        assert_eq!(stats.persisted, 3);
    }

    #[tokio::test]
    async fn every_trade_pushes_trade_and_four_candles() {
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(Arc::new(InMemoryCandleStore::new()), sink.clone());

        let report = engine.ingest(trade(dec!(100), 1_000)).await;
        assert_eq!(report.publish, PublishTally { published: 5, failed: 0 });

        let events = sink.take();
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], FeedEvent::LiveTrade(t) if t.price == dec!(100)));
        let timeframes: Vec<Timeframe> = events[1..]
            .iter()
            .filter_map(|e| match e {
                FeedEvent::CandleUpdate(c) => Some(c.timeframe),
                FeedEvent::LiveTrade(_) => None,
            })
            .collect();
        assert_eq!(timeframes, Timeframe::ALL.to_vec());
    }

    #[tokio::test]
    async fn late_trade_is_counted_and_still_published() {
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(Arc::new(InMemoryCandleStore::new()), sink.clone());

        engine.ingest(trade(dec!(100), 31_000)).await;
        let report = engine.ingest(trade(dec!(1), 29_000)).await;

        assert_eq!(report.outcome.late.len(), 1);
        assert_eq!(report.outcome.late[0].timeframe, Timeframe::S30);
        assert_eq!(engine.stats().late_trades, 1);
        assert_eq!(report.publish.published, 5);
        let open = engine.aggregator().snapshot("BTCUSDT", Timeframe::S30).unwrap();
        assert_eq!(open.low, dec!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failure_is_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let engine = engine_with(store.clone(), Arc::new(RecordingSink::default()));

        engine.ingest(trade(dec!(100), 0)).await;
        engine.ingest(trade(dec!(101), 30_000)).await;
        engine.flush_persistence().await;

        let stats = engine.stats();
        assert_eq!((stats.persisted, stats.persist_failures), (1, 0));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.latest("BTCUSDT", Timeframe::S30).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_do_not_block_later_trades() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let engine = engine_with(store.clone(), Arc::new(RecordingSink::default()));

        engine.ingest(trade(dec!(100), 0)).await;
        engine.ingest(trade(dec!(101), 30_000)).await;
        let report = engine.ingest(trade(dec!(102), 31_000)).await;
        assert_eq!(report.publish.published, 5);
        let open = engine.aggregator().snapshot("BTCUSDT", Timeframe::S30).unwrap();
        assert_eq!((open.bucket_start, open.close), (30_000, dec!(102)));

        engine.flush_persistence().await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().persist_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_does_not_delay_ingest() {
        let engine = engine_with(Arc::new(StalledStore), Arc::new(RecordingSink::default()));

        let started = Instant::now();
        engine.ingest(trade(dec!(100), 0)).await;
        let report = engine.ingest(trade(dec!(101), 30_000)).await;
        let next = engine.ingest(trade(dec!(102), 31_000)).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(report.queued, 1);
        assert_eq!(next.publish.published, 5);

        // The writer still gives up on the candle once its retries time out.
        engine.flush_persistence().await;
        assert_eq!(engine.stats().persist_failures, 1);
    }

    #[tokio::test]
    async fn publish_failure_does_not_affect_persistence() {
        let store = Arc::new(InMemoryCandleStore::new());
        let engine = engine_with(store.clone(), Arc::new(FailingSink));

        engine.ingest(trade(dec!(100), 0)).await;
        let report = engine.ingest(trade(dec!(101), 30_000)).await;
        engine.flush_persistence().await;

        assert_eq!(report.publish, PublishTally { published: 0, failed: 5 });
        assert_eq!(report.queued, 1);
        assert_eq!(engine.stats().publish_failures, 10);
        assert_eq!(store.len(Timeframe::S30), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_counted() {
        let engine = engine_with(
            Arc::new(InMemoryCandleStore::new()),
            Arc::new(RecordingSink::default()),
        );

        for raw in ["{not json", r#"{"symbol":"BTCUSDT","price":1}"#] {
            let err = parse_trade_event(raw).unwrap_err();
            engine.record_malformed(&err);
        }
        let ok = parse_trade_event(r#"{"symbol":"BTCUSDT","price":100.5,"quantity":1,"timestamp":5}"#)
            .unwrap();
        engine.ingest(ok).await;

        let stats = engine.stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.trades, 1);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_candles() {
        let store = Arc::new(InMemoryCandleStore::new());
        let engine = engine_with(store.clone(), Arc::new(RecordingSink::default()));

        engine.ingest(trade(dec!(100), 0)).await;
        engine.ingest(trade(dec!(101), 3_600_000)).await;
        engine.shutdown().await;

        for tf in Timeframe::ALL {
            assert_eq!(store.len(tf), 1);
        }
        assert_eq!(engine.stats().persisted, 4);
    }
}
