// =============================================================================
// Central Application State: Candle Relay
// =============================================================================
//
// Ties the engine, the subscriber registry and the static configuration
// together for the HTTP and WebSocket handlers. The engine and sink manage
// their own interior mutability; AppState only adds connection bookkeeping.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::CandleEngine;
use crate::fanout::BroadcastSink;
use crate::runtime_config::RuntimeConfig;
use crate::store::CandleStore;

/// Application state shared across all handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub engine: Arc<CandleEngine>,
    pub sink: BroadcastSink,

    /// WebSocket sessions currently open.
    pub ws_connections: AtomicU64,
    /// Total messages written to WebSocket clients since startup.
    pub ws_messages_sent: AtomicU64,

    /// Instant when the relay was started. Used for uptime calculations.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, engine: Arc<CandleEngine>, sink: BroadcastSink) -> Self {
        Self {
            config,
            engine,
            sink,
            ws_connections: AtomicU64::new(0),
            ws_messages_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        self.engine.store()
    }

    pub fn open_connections(&self) -> u64 {
        self.ws_connections.load(Ordering::Relaxed)
    }
}
