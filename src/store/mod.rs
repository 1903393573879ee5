// =============================================================================
// Candle Store Gateway
// =============================================================================
//
// Narrow read/write contract against a time-series store. Each timeframe is
// its own partition; writes are upserts keyed by (symbol, bucket_start) within
// that partition, so replaying a closed candle is harmless.
// =============================================================================

pub mod memory;
pub mod sqlite;
pub mod writer;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::market_data::Timeframe;
use crate::types::CandleRecord;

pub use memory::InMemoryCandleStore;
pub use sqlite::SqliteCandleStore;
pub use writer::{CandleWriter, PersistPolicy};

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Upsert one closed candle. Writing the same key again overwrites its
    /// OHLC values.
    async fn persist(&self, record: &CandleRecord) -> Result<(), StoreError>;

    /// Most recent `limit` candles for a key, newest first.
    async fn recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<CandleRecord>, StoreError>;

    /// Latest persisted candle for a key, `None` when nothing is stored yet.
    async fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<CandleRecord>, StoreError> {
        Ok(self.recent(symbol, timeframe, 1).await?.into_iter().next())
    }
}
