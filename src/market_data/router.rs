use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::CandleEngine;
use crate::types::Trade;

struct Worker {
    tx: mpsc::Sender<Trade>,
    task: JoinHandle<()>,
}

/// Routes trades to one worker task per symbol.
///
/// Each worker drains its own queue in order, so a symbol's trades are
/// applied exactly in delivery order while different symbols proceed in
/// parallel. A full queue applies backpressure to the feed.
pub struct TradeRouter {
    engine: Arc<CandleEngine>,
    workers: Mutex<HashMap<String, Worker>>,
    queue_depth: usize,
}

impl TradeRouter {
    pub fn new(engine: Arc<CandleEngine>, queue_depth: usize) -> Self {
        Self {
            engine,
            workers: Mutex::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn engine(&self) -> &Arc<CandleEngine> {
        &self.engine
    }

    fn sender_for(&self, symbol: &str) -> mpsc::Sender<Trade> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(symbol) {
            if !worker.tx.is_closed() {
                return worker.tx.clone();
            }
        }

        let (tx, mut rx) = mpsc::channel::<Trade>(self.queue_depth);
        let engine = self.engine.clone();
        let sym = symbol.to_string();
        let task = tokio::spawn(async move {
            debug!(symbol = %sym, "symbol worker started");
            while let Some(trade) = rx.recv().await {
                engine.ingest(trade).await;
            }
            debug!(symbol = %sym, "symbol worker stopped");
        });

        info!(symbol = %symbol, "spawned symbol worker");
        workers.insert(symbol.to_string(), Worker { tx: tx.clone(), task });
        tx
    }

    /// Queue a trade on its symbol's worker.
    pub async fn dispatch(&self, trade: Trade) {
        let tx = self.sender_for(&trade.symbol);
        if let Err(e) = tx.send(trade).await {
            error!(symbol = %e.0.symbol, "symbol worker gone, trade dropped");
        }
    }

    /// Number of symbols with a live worker.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Close every queue and wait for the workers to drain what they hold.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, Worker)> = self.workers.lock().drain().collect();
        for (symbol, worker) in workers {
            drop(worker.tx);
            if let Err(e) = worker.task.await {
                error!(symbol = %symbol, error = %e, "symbol worker panicked");
            }
        }
    }
}
