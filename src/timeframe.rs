// =============================================================================
// Timeframe — closed enum of supported candle durations
// =============================================================================
//
// The string form ("1m", "4h", ...) only appears at the boundaries:
// subscription frames, REST query parameters, and sink columns. Everything
// inside the engine carries the enum.
// =============================================================================

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 11] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::Mo1,
    ];

    /// Parse the canonical string form ("1m", "1h", "1M", ...).
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "2h" => Ok(Self::H2),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            "1M" => Ok(Self::Mo1),
            other => Err(ConfigError::UnknownTimeframe(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    /// Fixed duration in seconds. `None` for the monthly timeframe, whose
    /// length depends on the calendar.
    pub fn fixed_duration_secs(&self) -> Option<i64> {
        match self {
            Self::M1 => Some(60),
            Self::M3 => Some(180),
            Self::M5 => Some(300),
            Self::M15 => Some(900),
            Self::M30 => Some(1800),
            Self::H1 => Some(3600),
            Self::H2 => Some(7200),
            Self::H4 => Some(14_400),
            Self::D1 => Some(86_400),
            Self::W1 => Some(604_800),
            Self::Mo1 => None,
        }
    }

    /// Duration in minutes as used by Bybit and Kraken subscription formats.
    pub fn minutes(&self) -> Option<i64> {
        self.fixed_duration_secs().map(|s| s / 60)
    }

    /// Inclusive end timestamp of the interval starting at `open_ts`.
    ///
    /// Monthly candles end one second before the first instant of the next
    /// calendar month (UTC).
    pub fn end_ts_from_open(&self, open_ts: i64) -> i64 {
        match self.fixed_duration_secs() {
            Some(dur) => open_ts + dur - 1,
            None => {
                let open = Utc
                    .timestamp_opt(open_ts, 0)
                    .single()
                    .expect("candle timestamps stay within chrono range");
                let (y, m) = if open.month() == 12 {
                    (open.year() + 1, 1)
                } else {
                    (open.year(), open.month() + 1)
                };
                let next_month = Utc
                    .with_ymd_and_hms(y, m, 1, 0, 0, 0)
                    .single()
                    .expect("first of month is unambiguous in UTC");
                next_month.timestamp() - 1
            }
        }
    }

    /// Whether `open_ts` sits on this timeframe's boundary.
    ///
    /// Weekly alignment is exchange-defined and monthly alignment is
    /// calendar-based, so only the fixed timeframes up to `1d` are checked.
    pub fn is_aligned(&self, open_ts: i64) -> bool {
        match self {
            Self::W1 | Self::Mo1 => true,
            _ => {
                let dur = self.fixed_duration_secs().expect("fixed timeframe");
                open_ts % dur == 0
            }
        }
    }

    /// Floor `ts` to this timeframe's boundary. Only meaningful for the
    /// fixed timeframes.
    pub fn align_down(&self, ts: i64) -> i64 {
        match self.fixed_duration_secs() {
            Some(dur) => (ts / dur) * dur,
            None => ts,
        }
    }

    /// Whether candles of this timeframe can be rolled up into `target`.
    pub fn can_aggregate_to(&self, target: Timeframe) -> bool {
        match (self.fixed_duration_secs(), target.fixed_duration_secs()) {
            (Some(base), Some(tgt)) => tgt > base && tgt % base == 0,
            _ => false,
        }
    }

    /// Default ring-buffer capacity for this timeframe. Smaller timeframes
    /// keep more entries; the processor widens this when an aggregation
    /// target needs a longer history.
    pub fn buffer_size(&self) -> usize {
        match self {
            Self::M1 => 500,
            Self::M3 => 400,
            Self::M5 => 300,
            Self::M15 => 200,
            Self::M30 => 120,
            Self::H1 => 100,
            Self::H2 => 72,
            Self::H4 => 48,
            Self::D1 => 40,
            Self::W1 => 24,
            Self::Mo1 => 24,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
