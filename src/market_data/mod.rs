pub mod aggregator;
pub mod mock_feed;
pub mod router;
pub mod timeframe;
pub mod trade_stream;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Timeframe`).
pub use aggregator::{Bucket, CandleAggregator, LateTrade, TradeOutcome};
pub use router::TradeRouter;
pub use timeframe::{bucket_start, Timeframe};
