// =============================================================================
// Candle Writer: background persistence of closed candles
// =============================================================================
//
// Symbol workers hand closed candles over with `submit`, which never waits.
// A single writer task drains the queue in order and applies the timeout and
// retry policy. A stalled store only backs up this queue; once it is full,
// further candles are dropped and counted rather than blocking ingestion.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::store::CandleStore;
use crate::types::CandleRecord;

/// Timeouts and retry policy for one persist.
#[derive(Debug, Clone)]
pub struct PersistPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

enum WriterMsg {
    Persist(CandleRecord),
    #[cfg(test)]
    Flush(tokio::sync::oneshot::Sender<()>),
}

#[derive(Default)]
struct WriterCounters {
    persisted: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

pub struct CandleWriter {
    tx: Mutex<Option<mpsc::Sender<WriterMsg>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<WriterCounters>,
}

impl CandleWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn CandleStore>, policy: PersistPolicy, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriterMsg>(capacity.max(1));
        let counters = Arc::new(WriterCounters::default());

        let task_counters = counters.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Persist(record) => {
                        let counter = match persist_with_retry(store.as_ref(), &policy, &record).await {
                            Ok(()) => &task_counters.persisted,
                            Err(_) => &task_counters.failures,
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    #[cfg(test)]
                    WriterMsg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("candle writer stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            counters,
        }
    }

    /// Queue a closed candle. Returns `false` if it was dropped because the
    /// queue is full or the writer has shut down.
    pub fn submit(&self, record: CandleRecord) -> bool {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            self.reject(&record, "writer shut down");
            return false;
        };
        match tx.try_send(WriterMsg::Persist(record)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(WriterMsg::Persist(record))) => {
                self.reject(&record, "persist queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(WriterMsg::Persist(record))) => {
                self.reject(&record, "writer task gone");
                false
            }
            #[allow(unreachable_patterns)]
            Err(_) => false,
        }
    }

    fn reject(&self, record: &CandleRecord, reason: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            symbol = %record.symbol,
            timeframe = %record.timeframe,
            bucket = record.bucket_start,
            reason,
            "closed candle dropped before persist"
        );
    }

    /// Wait until every candle submitted so far has been written or given up on.
    #[cfg(test)]
    pub async fn flush(&self) {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return;
        };
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if tx.send(WriterMsg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Close the queue and wait for the writer to drain it.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "candle writer panicked");
            }
        }
    }

    pub fn persisted(&self) -> u64 {
        self.counters.persisted.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

async fn persist_with_retry(
    store: &dyn CandleStore,
    policy: &PersistPolicy,
    record: &CandleRecord,
) -> Result<(), StoreError> {
    let mut backoff = policy.backoff;
    let mut attempt = 0u32;

    loop {
        let result = match timeout(policy.timeout, store.persist(record)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(policy.timeout)),
        };

        match result {
            Ok(()) => {
                debug!(
                    symbol = %record.symbol,
                    timeframe = %record.timeframe,
                    bucket = record.bucket_start,
                    "closed candle persisted"
                );
                return Ok(());
            }
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                warn!(
                    symbol = %record.symbol,
                    timeframe = %record.timeframe,
                    bucket = record.bucket_start,
                    attempt,
                    error = %e,
                    "persist failed, retrying"
                );
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                error!(
                    symbol = %record.symbol,
                    timeframe = %record.timeframe,
                    bucket = record.bucket_start,
                    error = %e,
                    "persist failed, giving up on candle"
                );
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::market_data::Timeframe;
    use crate::store::InMemoryCandleStore;

    /// Fails the first `failures` persist calls, then delegates.
    pub(crate) struct FlakyStore {
        pub inner: InMemoryCandleStore,
        failures: AtomicU32,
        pub calls: AtomicU32,
    }

    impl FlakyStore {
        pub fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryCandleStore::new(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CandleStore for FlakyStore {
        async fn persist(&self, record: &CandleRecord) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.persist(record).await
        }

        async fn recent(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<CandleRecord>, StoreError> {
            self.inner.recent(symbol, timeframe, limit).await
        }
    }

    /// Every call hangs forever.
    pub(crate) struct StalledStore;

    #[async_trait]
    impl CandleStore for StalledStore {
        async fn persist(&self, _record: &CandleRecord) -> Result<(), StoreError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn recent(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Vec<CandleRecord>, StoreError> {
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    fn policy() -> PersistPolicy {
        PersistPolicy {
            timeout: Duration::from_millis(100),
            retries: 2,
            backoff: Duration::from_millis(10),
        }
    }

    fn record(start: i64) -> CandleRecord {
        CandleRecord {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::S30,
            bucket_start: start,
            open: dec!(1),
            high: dec!(2),
            low: dec!(1),
            close: dec!(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let writer = CandleWriter::spawn(store.clone(), policy(), 16);

        assert!(writer.submit(record(0)));
        writer.flush().await;

        assert_eq!(writer.persisted(), 1);
        assert_eq!(writer.failures(), 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.inner.latest("BTCUSDT", Timeframe::S30).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_counted_per_candle() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let writer = CandleWriter::spawn(store.clone(), policy(), 16);

        writer.submit(record(0));
        writer.submit(record(30_000));
        writer.flush().await;

        assert_eq!(writer.failures(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_instead_of_waiting() {
        let writer = CandleWriter::spawn(Arc::new(StalledStore), policy(), 1);

        // First one is taken by the task and stalls, second fills the queue.
        assert!(writer.submit(record(0)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(writer.submit(record(30_000)));
        assert!(!writer.submit(record(60_000)));
        assert_eq!(writer.dropped(), 1);

        writer.shutdown().await;
        assert_eq!(writer.failures(), 2);
        assert!(!writer.submit(record(90_000)));
        assert_eq!(writer.dropped(), 2);
    }
}
