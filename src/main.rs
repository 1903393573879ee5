// =============================================================================
// Candle Relay: Main Entry Point
// =============================================================================
//
// Ingests executed trades, aggregates them into 30s/1m/5m/1h candles,
// persists every closed candle and fans live state out to WebSocket clients
// both on every trade and on a fixed republish tick.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod engine;
mod error;
mod fanout;
mod market_data;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::engine::{CandleEngine, EngineSettings};
use crate::fanout::{BroadcastSink, LivePublisher};
use crate::market_data::TradeRouter;
use crate::runtime_config::{RuntimeConfig, TradeFeed};
use crate::store::{CandleStore, InMemoryCandleStore, SqliteCandleStore};

const CONFIG_PATH: &str = "candle_config.json";

/// Delay before reconnecting to the exchange feed.
const FEED_RECONNECT_SECS: u64 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Relay — starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        if !std::path::Path::new(CONFIG_PATH).exists() {
            if let Err(e) = defaults.save(CONFIG_PATH) {
                warn!(error = %e, "Failed to write default config template");
            }
        }
        defaults
    });
    config.apply_env_overrides()?;

    info!(
        symbols = ?config.symbols,
        trade_feed = %config.trade_feed,
        republish_ms = config.republish_interval_ms,
        "Configured relay"
    );

    // ── 2. Candle store ──────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = match &config.store_path {
        Some(path) => Arc::new(
            SqliteCandleStore::open(path)
                .with_context(|| format!("failed to open candle store at {path}"))?,
        ),
        None => {
            warn!("No store_path configured — closed candles are kept in memory only");
            Arc::new(InMemoryCandleStore::new())
        }
    };

    // ── 3. Fan-out + engine ──────────────────────────────────────────────
    let sink = BroadcastSink::new(config.broadcast_capacity);
    let publisher = Arc::new(LivePublisher::new(
        Arc::new(sink.clone()),
        config.publish_timeout(),
    ));
    let engine = Arc::new(CandleEngine::new(
        store.clone(),
        publisher.clone(),
        EngineSettings::from_config(&config),
    ));
    let router = Arc::new(TradeRouter::new(engine.clone(), config.router_queue));

    // ── 4. Periodic republish loop ───────────────────────────────────────
    let republish = publisher.clone().spawn_republish(
        store.clone(),
        config.symbols.clone(),
        config.republish_interval(),
    );

    // ── 5. Trade feed ────────────────────────────────────────────────────
    let feed_router = router.clone();
    let symbols = config.symbols.clone();
    let feed_task = match config.trade_feed {
        feed @ (TradeFeed::Binance | TradeFeed::Relay) => {
            let relay_url = config.relay_url.clone();
            tokio::spawn(async move {
                loop {
                    let result = match feed {
                        TradeFeed::Relay => {
                            market_data::trade_stream::run_relay_stream(&relay_url, &feed_router).await
                        }
                        _ => market_data::trade_stream::run_trade_stream(&symbols, &feed_router).await,
                    };
                    if let Err(e) = result {
                        error!(error = %e, feed = %feed, retry_secs = FEED_RECONNECT_SECS, "Trade stream error — reconnecting");
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs(FEED_RECONNECT_SECS)).await;
                }
            })
        }
        TradeFeed::Mock => {
            let period = config.mock_interval();
            tokio::spawn(async move {
                market_data::mock_feed::run_mock_feed(symbols, period, &feed_router).await;
            })
        }
    };

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, engine.clone(), sink));
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    feed_task.abort();
    let _ = feed_task.await;
    router.shutdown().await;
    engine.shutdown().await;
    republish.stop().await;

    let stats = engine.stats();
    info!(
        trades = stats.trades,
        persisted = stats.persisted,
        persist_failures = stats.persist_failures,
        persist_dropped = stats.persist_dropped,
        "Candle Relay shut down complete."
    );
    Ok(())
}
