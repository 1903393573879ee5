// =============================================================================
// Trade Stream: inbound decoding and the WebSocket trade feed adapters
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::market_data::TradeRouter;
use crate::types::Trade;

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Helper: feeds send numbers either as JSON numbers or as strings.
fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal, IngestError> {
    let raw = match val {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => return Err(IngestError::malformed(format!("missing field {name}"))),
        _ => return Err(IngestError::malformed(format!("field {name} has unexpected JSON type"))),
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|e| IngestError::malformed(format!("failed to parse {name} as decimal ({raw}): {e}")))
}

fn parse_timestamp(val: &serde_json::Value, name: &str) -> Result<i64, IngestError> {
    match val {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| IngestError::malformed(format!("field {name} is not an integer"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| IngestError::malformed(format!("failed to parse {name}: {e}"))),
        serde_json::Value::Null => Err(IngestError::malformed(format!("missing field {name}"))),
        _ => Err(IngestError::malformed(format!("field {name} has unexpected JSON type"))),
    }
}

/// Parse a normalised trade event.
///
/// Expected shape:
/// ```json
/// { "symbol": "BTCUSDT", "price": 110000.5, "quantity": 0.01, "timestamp": 1700000000000 }
/// ```
pub fn parse_trade_event(text: &str) -> Result<Trade, IngestError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| IngestError::malformed(format!("invalid JSON: {e}")))?;

    let symbol = root["symbol"]
        .as_str()
        .ok_or_else(|| IngestError::malformed("missing field symbol"))?;
    let price = parse_decimal(&root["price"], "price")?;
    let quantity = parse_decimal(&root["quantity"], "quantity")?;
    let timestamp = parse_timestamp(&root["timestamp"], "timestamp")?;

    Trade::new(symbol, price, quantity, timestamp)
}

/// Parse one message of the Binance combined trade stream.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@trade",
///   "data": { "e": "trade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000000 } }
/// ```
///
/// Returns `Ok(None)` for anything that is well-formed but not a trade
/// (subscription acks and the like).
pub fn parse_binance_message(text: &str) -> Result<Option<Trade>, IngestError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| IngestError::malformed(format!("invalid JSON: {e}")))?;

    // Support both combined-stream envelope and direct single-stream payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if data["e"].as_str() != Some("trade") {
        return Ok(None);
    }

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| IngestError::malformed("missing field s"))?;
    let price = parse_decimal(&data["p"], "p")?;
    let quantity = parse_decimal(&data["q"], "q")?;
    let timestamp = parse_timestamp(&data["T"], "T")?;

    Trade::new(symbol, price, quantity, timestamp).map(Some)
}

/// Build the Binance combined-stream URL for all symbols.
pub fn build_trade_stream_url(symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    format!(
        "wss://stream.binance.com:9443/stream?streams={}",
        streams.join("/")
    )
}

// ---------------------------------------------------------------------------
// Trade WebSocket streams
// ---------------------------------------------------------------------------

/// Decoder for one text frame: `Ok(None)` for well-formed non-trade frames.
type FrameDecoder = fn(&str) -> Result<Option<Trade>, IngestError>;

/// Connect to the Binance combined trade stream and hand every trade to the
/// router.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection.
pub async fn run_trade_stream(symbols: &[String], router: &TradeRouter) -> Result<()> {
    let url = build_trade_stream_url(symbols);
    pump_stream(&url, router, parse_binance_message).await
}

/// Connect to an upstream that already sends normalised trade events and hand
/// every trade to the router. Same reconnect contract as [`run_trade_stream`].
pub async fn run_relay_stream(url: &str, router: &TradeRouter) -> Result<()> {
    pump_stream(url, router, |text| parse_trade_event(text).map(Some)).await
}

async fn pump_stream(url: &str, router: &TradeRouter, decode: FrameDecoder) -> Result<()> {
    info!(url = %url, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(url = %url, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match decode(&text) {
                        Ok(Some(trade)) => router.dispatch(trade).await,
                        Ok(None) => debug!(msg = %text, "ignoring non-trade message"),
                        Err(e) => router.engine().record_malformed(&e),
                    }
                }
                // Ping / Pong / Binary / Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
