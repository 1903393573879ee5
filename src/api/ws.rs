// =============================================================================
// WebSocket Handler: live candle and trade feed
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive every `live-trade` and
// `candle-update` event as a JSON text frame. A client may narrow the feed:
//
//   { "type": "subscribe",   "symbol": "BTCUSDT" }
//   { "type": "unsubscribe", "symbol": "BTCUSDT" }
//
// With no subscriptions, everything is forwarded. A client that falls behind
// the broadcast buffer skips what it missed; the republish loop brings it back
// to current state within one tick.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::fanout::FeedEvent;

// =============================================================================
// Client messages
// =============================================================================

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
}

/// Per-connection symbol filter. Empty means "everything".
#[derive(Debug, Default)]
struct Subscriptions {
    symbols: HashSet<String>,
}

impl Subscriptions {
    fn wants(&self, event: &FeedEvent) -> bool {
        self.symbols.is_empty() || self.symbols.contains(event.symbol())
    }

    fn apply(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Subscribe { symbol } => {
                self.symbols.insert(symbol.trim().to_uppercase());
            }
            ClientMessage::Unsubscribe { symbol } => {
                self.symbols.remove(&symbol.trim().to_uppercase());
            }
        }
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent branches via `tokio::select!`:
///   1. **Forward**: relay broadcast events that pass the client's filter.
///   2. **Recv**: process subscribe/unsubscribe, Ping/Pong and Close.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};

    let conn_id = Uuid::new_v4();
    let mut events = state.sink.subscribe();
    state.ws_connections.fetch_add(1, Ordering::Relaxed);
    info!(conn = %conn_id, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut subs = Subscriptions::default();

    loop {
        tokio::select! {
            // ── Forward: broadcast → client ─────────────────────────────
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !subs.wants(&event) {
                            continue;
                        }
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize feed event");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(conn = %conn_id, error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                        state.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(conn = %conn_id, skipped, "WebSocket client lagging — events skipped");
                    }
                    Err(RecvError::Closed) => {
                        info!(conn = %conn_id, "event channel closed");
                        break;
                    }
                }
            }

            // ── Recv: client → server ───────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(cmd) => {
                                debug!(conn = %conn_id, cmd = ?cmd, "subscription change");
                                subs.apply(cmd);
                            }
                            Err(e) => {
                                debug!(conn = %conn_id, error = %e, "ignoring unrecognised client message");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(conn = %conn_id, "WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn = %conn_id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    info!(conn = %conn_id, "WebSocket connection closed — cleanup complete");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trade;
    use rust_decimal_macros::dec;

    fn event(symbol: &str) -> FeedEvent {
        FeedEvent::from(&Trade::new(symbol, dec!(1), dec!(1), 0).unwrap())
    }

    #[test]
    fn parse_client_messages() {
        let sub: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","symbol":"BTCUSDT"}"#).unwrap();
        assert_eq!(sub, ClientMessage::Subscribe { symbol: "BTCUSDT".into() });
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"hello"}"#).is_err());
    }

    #[test]
    fn empty_filter_passes_everything() {
        let subs = Subscriptions::default();
        assert!(subs.wants(&event("BTCUSDT")));
        assert!(subs.wants(&event("ETHUSDT")));
    }

    #[test]
    fn filter_narrows_to_subscribed_symbols() {
        let mut subs = Subscriptions::default();
        subs.apply(ClientMessage::Subscribe { symbol: "btcusdt".into() });
        assert!(subs.wants(&event("BTCUSDT")));
        assert!(!subs.wants(&event("ETHUSDT")));

        subs.apply(ClientMessage::Unsubscribe { symbol: "BTCUSDT".into() });
        assert!(subs.wants(&event("ETHUSDT")));
    }
}
