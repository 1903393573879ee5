// =============================================================================
// Error kinds recovered at component boundaries
// =============================================================================
//
// None of these propagate out of the aggregation loop. Each is logged where it
// is caught and the pipeline moves on to the next trade or tick.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// An inbound payload that cannot be turned into a [`crate::types::Trade`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("malformed trade: {0}")]
    MalformedTrade(String),
}

impl IngestError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedTrade(msg.into())
    }
}

/// Failure talking to the candle store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Worker(e.to_string())
    }
}

/// Failure handing an event to the subscriber registry.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("subscriber sink unavailable: {0}")]
    Unavailable(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}
