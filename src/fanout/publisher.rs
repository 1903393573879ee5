// =============================================================================
// Live Fan-out Publisher: push path + periodic republish
// =============================================================================
//
// Two independent producers into one sink:
//   1. Push: every trade emits a `live-trade` event and one `candle-update`
//      per timeframe with the open bucket, right after aggregation.
//   2. Poll: a timer re-reads the latest persisted candle for every
//      configured (symbol, timeframe) and republishes it, changed or not.
//
// A failed publish is logged and dropped. Nothing is retried here; the next
// trade or the next tick publishes current state again.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{PublishError, StoreError};
use crate::fanout::{EventSink, FeedEvent};
use crate::market_data::{Bucket, Timeframe};
use crate::store::CandleStore;
use crate::types::Trade;

/// Counts from one batch of publish calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishTally {
    pub published: usize,
    pub failed: usize,
}

impl PublishTally {
    fn record(&mut self, result: Result<usize, PublishError>) {
        match result {
            Ok(_) => self.published += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct LivePublisher {
    sink: Arc<dyn EventSink>,
    publish_timeout: Duration,
    failures: AtomicU64,
}

impl LivePublisher {
    pub fn new(sink: Arc<dyn EventSink>, publish_timeout: Duration) -> Self {
        Self {
            sink,
            publish_timeout,
            failures: AtomicU64::new(0),
        }
    }

    /// Total publish failures across both paths since startup.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn send(&self, event: FeedEvent) -> Result<usize, PublishError> {
        let symbol = event.symbol().to_string();
        let result = match timeout(self.publish_timeout, self.sink.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        };
        if let Err(e) = &result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %symbol, error = %e, "publish failed");
        }
        result
    }

    /// Push path: the trade itself, then the open bucket of every timeframe.
    pub async fn push(&self, trade: &Trade, live: &[Bucket]) -> PublishTally {
        let mut tally = PublishTally::default();
        tally.record(self.send(FeedEvent::from(trade)).await);
        for bucket in live {
            tally.record(self.send(FeedEvent::from(bucket)).await);
        }
        tally
    }

    /// Poll path, one pass: republish the latest persisted candle for every
    /// `(symbol, timeframe)`. Keys with nothing persisted yet are skipped.
    /// Each store read is bounded by the same timeout as a publish.
    pub async fn republish_once(&self, store: &dyn CandleStore, symbols: &[String]) -> PublishTally {
        let mut tally = PublishTally::default();
        for symbol in symbols {
            for tf in Timeframe::ALL {
                let read = match timeout(self.publish_timeout, store.latest(symbol, tf)).await {
                    Ok(read) => read,
                    Err(_) => Err(StoreError::Timeout(self.publish_timeout)),
                };
                match read {
                    Ok(Some(record)) => tally.record(self.send(FeedEvent::from(&record)).await),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "republish read failed");
                    }
                }
            }
        }
        tally
    }

    /// Start the periodic republish loop. Dropping or stopping the returned
    /// handle ends the loop as a whole.
    pub fn spawn_republish(
        self: Arc<Self>,
        store: Arc<dyn CandleStore>,
        symbols: Vec<String>,
        period: Duration,
    ) -> RepublishHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_ms = period.as_millis() as u64, symbols = ?symbols, "republish loop started");

            // Any change on the watch, or the handle being dropped, stops the
            // loop, including in the middle of a tick.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                tokio::select! {
                    tally = self.republish_once(store.as_ref(), &symbols) => {
                        debug!(published = tally.published, failed = tally.failed, "republish tick");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("republish loop stopped");
        });

        RepublishHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Owner of the running republish loop.
pub struct RepublishHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RepublishHandle {
    /// Signal the loop to stop and wait for the task to exit. An in-flight
    /// tick is abandoned.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "republish loop ended abnormally");
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
