use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::market_data::TradeRouter;
use crate::types::Trade;

/// Relative width of one random-walk step (±0.05% of the base price).
const STEP_FRACTION: f64 = 0.001;

/// The walk is reflected back inside ±2% of the base price.
const MAX_DRIFT: f64 = 0.02;

fn base_price(symbol: &str) -> f64 {
    match symbol {
        "BTCUSDT" => 110_000.0,
        "XAUUSD" => 3_400.0,
        "EURUSD" => 1.15,
        _ => 100.0,
    }
}

fn reflect_into_band(price: f64, base: f64) -> f64 {
    let (low, high) = (base * (1.0 - MAX_DRIFT), base * (1.0 + MAX_DRIFT));
    if price > high {
        (2.0 * high - price).max(low)
    } else if price < low {
        (2.0 * low - price).min(high)
    } else {
        price
    }
}

/// Random-walk trade generator for running without an exchange connection.
pub struct MockFeed {
    prices: HashMap<String, f64>,
    rng: StdRng,
}

impl MockFeed {
    pub fn new(symbols: &[String]) -> Self {
        Self::with_rng(symbols, StdRng::from_entropy())
    }

    pub fn with_rng(symbols: &[String], rng: StdRng) -> Self {
        let prices = symbols
            .iter()
            .map(|s| (s.clone(), base_price(s)))
            .collect();
        Self { prices, rng }
    }

    /// One trade per symbol, stamped `now_ms`.
    pub fn next_trades(&mut self, now_ms: i64) -> Vec<Trade> {
        let mut symbols: Vec<String> = self.prices.keys().cloned().collect();
        symbols.sort();

        let mut trades = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let base = base_price(&symbol);
            let step = (self.rng.gen::<f64>() - 0.5) * base * STEP_FRACTION;
            let last = self.prices.get(&symbol).copied().unwrap_or(base);
            let price = reflect_into_band(last + step, base);
            self.prices.insert(symbol.clone(), price);

            let quantity = self.rng.gen_range(0.0..10.0);
            let (Some(price), Some(quantity)) = (
                Decimal::from_f64_retain(price),
                Decimal::from_f64_retain(quantity),
            ) else {
                continue;
            };

            let quantity = quantity.round_dp_with_strategy(4, RoundingStrategy::ToZero);
            match Trade::new(symbol, price.round_dp(5), quantity, now_ms) {
                Ok(trade) => trades.push(trade),
                Err(e) => warn!(error = %e, "mock feed produced an invalid trade"),
            }
        }
        trades
    }
}

/// Feed mock trades into the router every `period` until the task is dropped.
pub async fn run_mock_feed(symbols: Vec<String>, period: Duration, router: &TradeRouter) {
    let mut feed = MockFeed::new(&symbols);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(symbols = ?symbols, period_ms = period.as_millis() as u64, "mock trade feed started");

    loop {
        ticker.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        for trade in feed.next_trades(now_ms) {
            router.dispatch(trade).await;
        }
    }
}
