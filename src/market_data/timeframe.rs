// =============================================================================
// Timeframes and bucket alignment
// =============================================================================
//
// The aggregation windows are a closed set. `bucket_start` is the single
// place where a timestamp is mapped onto a window; the aggregator, the store
// and any backfill tooling must all go through it.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed aggregation window.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "30s")]
    S30,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
}

impl Timeframe {
    /// Every timeframe, shortest first. A trade updates all of them.
    pub const ALL: [Timeframe; 4] = [Self::S30, Self::M1, Self::M5, Self::H1];

    /// Window length in milliseconds.
    pub const fn window_ms(self) -> i64 {
        match self {
            Self::S30 => 30_000,
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::H1 => 3_600_000,
        }
    }

    /// Wire label (`"30s"`, `"1m"`, `"5m"`, `"1h"`).
    pub const fn label(self) -> &'static str {
        match self {
            Self::S30 => "30s",
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1h",
        }
    }

    /// Physical table backing this timeframe's partition.
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::S30 => "candles_30s",
            Self::M1 => "candles_1m",
            Self::M5 => "candles_5m",
            Self::H1 => "candles_1h",
        }
    }

    /// Position inside [`Timeframe::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::S30 => 0,
            Self::M1 => 1,
            Self::M5 => 2,
            Self::H1 => 3,
        }
    }

    /// Parse a wire label. Returns `None` for anything outside the fixed set.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.label() == label)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("invalid timeframe: {s}"))
    }
}

/// Start of the window containing `timestamp_ms`:
/// `floor(timestamp / window) * window`.
///
/// Uses euclidean division so that pre-epoch timestamps still floor towards
/// negative infinity.
pub fn bucket_start(timestamp_ms: i64, timeframe: Timeframe) -> i64 {
    let window = timeframe.window_ms();
    timestamp_ms.div_euclid(window) * window
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_lengths() {
        assert_eq!(Timeframe::S30.window_ms(), 30_000);
        assert_eq!(Timeframe::M1.window_ms(), 60_000);
        assert_eq!(Timeframe::M5.window_ms(), 300_000);
        assert_eq!(Timeframe::H1.window_ms(), 3_600_000);
    }

    #[test]
    fn bucket_start_floors_into_window() {
        assert_eq!(bucket_start(0, Timeframe::S30), 0);
        assert_eq!(bucket_start(29_999, Timeframe::S30), 0);
        assert_eq!(bucket_start(35_000, Timeframe::S30), 30_000);
        assert_eq!(bucket_start(1_700_000_123_456, Timeframe::H1), 1_699_999_200_000);
    }

    #[test]
    fn boundary_timestamp_opens_its_own_window() {
        assert_eq!(bucket_start(60_000, Timeframe::M1), 60_000);
        assert_eq!(bucket_start(59_999, Timeframe::M1), 0);
        assert_eq!(bucket_start(300_000, Timeframe::M5), 300_000);
    }

    #[test]
    fn negative_timestamps_floor_downwards() {
        assert_eq!(bucket_start(-1, Timeframe::S30), -30_000);
        assert_eq!(bucket_start(-30_000, Timeframe::S30), -30_000);
    }

    #[test]
    fn same_bucket_iff_same_window_index() {
        for tf in Timeframe::ALL {
            let w = tf.window_ms();
            assert_eq!(bucket_start(5 * w, tf), bucket_start(6 * w - 1, tf));
            assert_ne!(bucket_start(6 * w - 1, tf), bucket_start(6 * w, tf));
        }
    }

    #[test]
    fn labels_parse_back() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_label(tf.label()), Some(tf));
            assert_eq!(tf.to_string().parse::<Timeframe>(), Ok(tf));
            assert_eq!(Timeframe::ALL[tf.index()], tf);
        }
        assert_eq!(Timeframe::from_label("15m"), None);
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn serde_uses_wire_labels() {
        assert_eq!(serde_json::to_string(&Timeframe::S30).unwrap(), "\"30s\"");
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf, Timeframe::H1);
    }
}
