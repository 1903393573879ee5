// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::market_data::Timeframe;

/// A single executed trade, normalised from whatever feed produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Trade {
    /// Build a trade, rejecting values no exchange would report.
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        quantity: Decimal,
        timestamp: i64,
    ) -> Result<Self, IngestError> {
        let symbol = symbol.into().trim().to_uppercase();
        if symbol.is_empty() {
            return Err(IngestError::malformed("empty symbol"));
        }
        if price <= Decimal::ZERO {
            return Err(IngestError::malformed(format!("non-positive price {price}")));
        }
        if quantity < Decimal::ZERO {
            return Err(IngestError::malformed(format!("negative quantity {quantity}")));
        }
        if timestamp < 0 {
            return Err(IngestError::malformed(format!("negative timestamp {timestamp}")));
        }
        Ok(Self {
            symbol,
            price,
            quantity,
            timestamp,
        })
    }
}

/// A closed, persisted OHLC window. Immutable once written; one logical row
/// per `(symbol, timeframe, bucket_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Window start in milliseconds since the Unix epoch.
    #[serde(rename = "time")]
    pub bucket_start: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
}
