use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use tracing::info;

use crate::error::StoreError;
use crate::market_data::Timeframe;
use crate::store::CandleStore;
use crate::types::CandleRecord;

/// SQLite-backed store with one table per timeframe (`candles_30s`, ...).
///
/// Prices are stored as TEXT so decimals round-trip exactly. rusqlite is
/// blocking, so every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCandleStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let store = Self::from_connection(Connection::open(path)?)?;
        info!(path = %path.display(), "sqlite candle store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        for tf in Timeframe::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    symbol TEXT NOT NULL,
                    bucket INTEGER NOT NULL,
                    open TEXT NOT NULL,
                    high TEXT NOT NULL,
                    low TEXT NOT NULL,
                    close TEXT NOT NULL,
                    PRIMARY KEY (symbol, bucket)
                )",
                table = tf.table_name()
            ))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }
}

fn parse_decimal(raw: &str, column: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw)
        .map_err(|e| StoreError::Backend(format!("bad {column} value {raw:?}: {e}")))
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn persist(&self, record: &CandleRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (symbol, bucket, open, high, low, close)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (symbol, bucket) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close",
                    table = record.timeframe.table_name()
                ),
                params![
                    record.symbol,
                    record.bucket_start,
                    record.open.to_string(),
                    record.high.to_string(),
                    record.low.to_string(),
                    record.close.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<CandleRecord>, StoreError> {
        let symbol = symbol.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT bucket, open, high, low, close
                 FROM {table}
                 WHERE symbol = ?1
                 ORDER BY bucket DESC
                 LIMIT ?2",
                table = timeframe.table_name()
            ))?;

            let rows: Vec<(i64, String, String, String, String)> = stmt
                .query_map(params![symbol, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(bucket, open, high, low, close)| -> Result<CandleRecord, StoreError> {
                    Ok(CandleRecord {
                        symbol: symbol.clone(),
                        timeframe,
                        bucket_start: bucket,
                        open: parse_decimal(&open, "open")?,
                        high: parse_decimal(&high, "high")?,
                        low: parse_decimal(&low, "low")?,
                        close: parse_decimal(&close, "close")?,
                    })
                })
                .collect()
        })
        .await
    }
}
