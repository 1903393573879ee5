// =============================================================================
// Runtime Configuration: relay settings with atomic save
// =============================================================================
//
// Everything tunable about the relay lives here: which symbols the poll path
// covers, the republish cadence, store location, and the timeouts/retries
// around persistence and publishing. The timeframe set is fixed in code.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_republish_interval_ms() -> u64 {
    250
}

fn default_persist_timeout_ms() -> u64 {
    2_000
}

fn default_persist_retries() -> u32 {
    2
}

fn default_persist_backoff_ms() -> u64 {
    100
}

fn default_publish_timeout_ms() -> u64 {
    1_000
}

fn default_broadcast_capacity() -> usize {
    1_024
}

fn default_mock_interval_ms() -> u64 {
    1_000
}

fn default_store_path() -> Option<String> {
    Some("candles.db".to_string())
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_history_limit() -> usize {
    50
}

fn default_router_queue() -> usize {
    1_024
}

fn default_persist_queue() -> usize {
    4_096
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8080/trades".to_string()
}

// =============================================================================
// TradeFeed
// =============================================================================

/// Where trades come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeFeed {
    /// Binance combined `@trade` stream.
    #[default]
    Binance,
    /// Upstream WebSocket sending normalised `{symbol, price, quantity, timestamp}` trades.
    Relay,
    /// Locally generated random-walk trades.
    Mock,
}

impl std::fmt::Display for TradeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Relay => write!(f, "relay"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for TradeFeed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "relay" => Ok(Self::Relay),
            "mock" => Ok(Self::Mock),
            other => anyhow::bail!("unknown trade feed {other:?} (expected binance, relay or mock)"),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Universe -------------------------------------------------------------

    /// Symbols subscribed on the feed and covered by the republish loop.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Trade source.
    #[serde(default)]
    pub trade_feed: TradeFeed,

    /// Upstream URL for the `relay` feed.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Period of the mock feed, one trade per symbol per period.
    #[serde(default = "default_mock_interval_ms")]
    pub mock_interval_ms: u64,

    // --- Fan-out --------------------------------------------------------------

    /// Republish period of the poll path.
    #[serde(default = "default_republish_interval_ms")]
    pub republish_interval_ms: u64,

    /// Upper bound on a single publish call.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Buffered events per WebSocket subscriber before it starts lagging.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    // --- Persistence ----------------------------------------------------------

    /// SQLite file for closed candles. `null` keeps candles in memory only.
    #[serde(default = "default_store_path")]
    pub store_path: Option<String>,

    /// Upper bound on a single persist call.
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,

    /// Extra attempts after a failed persist.
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,

    /// Delay before the first retry; doubled for every further one.
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,

    /// Closed candles waiting for the writer before new ones are dropped.
    #[serde(default = "default_persist_queue")]
    pub persist_queue: usize,

    // --- Ingestion ------------------------------------------------------------

    /// Per-symbol queue depth between the feed and the symbol's worker.
    #[serde(default = "default_router_queue")]
    pub router_queue: usize,

    // --- HTTP -----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Default number of candles returned by the history endpoint.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            trade_feed: TradeFeed::default(),
            relay_url: default_relay_url(),
            mock_interval_ms: default_mock_interval_ms(),
            republish_interval_ms: default_republish_interval_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            store_path: default_store_path(),
            persist_timeout_ms: default_persist_timeout_ms(),
            persist_retries: default_persist_retries(),
            persist_backoff_ms: default_persist_backoff_ms(),
            persist_queue: default_persist_queue(),
            router_queue: default_router_queue(),
            bind_addr: default_bind_addr(),
            history_limit: default_history_limit(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.normalize();

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trade_feed = %config.trade_feed,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Apply `CANDLE_*` environment overrides on top of file/default values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(syms) = std::env::var("CANDLE_SYMBOLS") {
            self.symbols = parse_symbols(&syms);
        }
        if let Ok(addr) = std::env::var("CANDLE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(feed) = std::env::var("CANDLE_FEED") {
            self.trade_feed = feed.parse()?;
        }
        if let Ok(path) = std::env::var("CANDLE_STORE_PATH") {
            self.store_path = if path.trim().is_empty() { None } else { Some(path) };
        }
        if let Ok(url) = std::env::var("CANDLE_RELAY_URL") {
            self.relay_url = url;
        }
        self.normalize();
        Ok(())
    }

    /// Bring symbols into the form trades carry (trimmed, upper-case, no
    /// duplicates). An empty list falls back to the default universe.
    pub fn normalize(&mut self) {
        self.symbols = parse_symbols(&self.symbols.join(","));
        if self.symbols.is_empty() {
            self.symbols = default_symbols();
        }
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms.max(1))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }

    pub fn mock_interval(&self) -> Duration {
        Duration::from_millis(self.mock_interval_ms.max(1))
    }
}

/// Split a comma-separated symbol list, upper-cased, blanks and repeats dropped.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for sym in raw.split(',').map(|s| s.trim().to_uppercase()) {
        if !sym.is_empty() && !out.contains(&sym) {
            out.push(sym);
        }
    }
    out
}
