// =============================================================================
// Exchange adapters — wiring the generic connector and REST pipeline to
// Binance, Bybit, OKX and Kraken
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod kraken;
pub mod okx;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::candle::Candle;
use crate::error::{ApiError, NormalizeError};
use crate::input::StreamInput;
use crate::timeframe::Timeframe;

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
    Kraken,
}

impl Exchange {
    pub fn parse(s: &str) -> Result<Self, crate::error::ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            "okx" => Ok(Self::Okx),
            "kraken" => Ok(Self::Kraken),
            other => Err(crate::error::ConfigError::UnknownExchange(
                other.to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Okx => "okx",
            Self::Kraken => "kraken",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market-type-aware wiring: exchange plus market type select the websocket
/// adapter (URL included).
pub fn ws_adapter(exchange: Exchange, market: crate::input::MarketType) -> std::sync::Arc<dyn WsAdapter> {
    match exchange {
        Exchange::Binance => std::sync::Arc::new(binance::BinanceWs::new(market)),
        Exchange::Bybit => std::sync::Arc::new(bybit::BybitWs::new(market)),
        Exchange::Okx => std::sync::Arc::new(okx::OkxWs::new(market)),
        Exchange::Kraken => std::sync::Arc::new(kraken::KrakenWs::new(market)),
    }
}

/// REST client wiring; limiters are selected (and shared) per exchange and
/// market type.
pub fn candle_api(exchange: Exchange, market: crate::input::MarketType) -> std::sync::Arc<dyn CandleApi> {
    match exchange {
        Exchange::Binance => std::sync::Arc::new(binance::BinanceApi::new(market)),
        Exchange::Bybit => std::sync::Arc::new(bybit::BybitApi::new(market)),
        Exchange::Okx => std::sync::Arc::new(okx::OkxApi::new(market)),
        Exchange::Kraken => std::sync::Arc::new(kraken::KrakenApi::new(market)),
    }
}

/// Exchange-specific pieces the websocket connector needs: where to connect,
/// what to send after connecting, how to keep the link alive, and how to map
/// incoming frames onto the canonical candle.
pub trait WsAdapter: Send + Sync {
    /// Lowercase exchange name stamped onto every candle.
    fn source(&self) -> &'static str;

    /// Connection URL for the given subscription (market-type aware where
    /// the exchange distinguishes markets).
    fn ws_url(&self, input: &StreamInput) -> String;

    /// JSON text frames to send right after connecting. Empty when the URL
    /// itself carries the subscription (Binance combined streams).
    fn subscribe_frames(&self, input: &StreamInput) -> Vec<String>;

    /// Application-level keepalive frame, for exchanges that require one.
    fn ping_frame(&self) -> Option<String> {
        None
    }

    /// Interval between keepalive frames; also bounds the receive timeout
    /// (2x this value without a frame triggers a reconnect).
    fn ping_interval(&self) -> Duration {
        Duration::from_secs(20)
    }

    /// Decode one WS frame. `Ok(None)` for non-data frames (acks, pongs,
    /// heartbeats, unsupported topics); `Err` for malformed data frames.
    fn normalize_ws(&self, value: &Value) -> Result<Option<Candle>, NormalizeError>;
}

/// Rate-limited, paged access to an exchange's historical kline endpoint.
#[async_trait]
pub trait CandleApi: Send + Sync {
    fn source(&self) -> &'static str;

    /// Maximum candles per request window.
    fn window_limit(&self) -> usize {
        1000
    }

    /// Fetch one window `[from_ts, to_ts]` (inclusive seconds). The window
    /// must span at most `window_limit()` candles. Rows come back
    /// chronologically ordered regardless of the wire order.
    async fn fetch_window(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>, ApiError>;

    /// Fetch `[from_ts, to_ts]` window by window, sequentially, so the
    /// caller sees chronologically ordered rows.
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>, ApiError> {
        let mut out = Vec::new();
        for (start, end) in split_windows(from_ts, to_ts, timeframe, self.window_limit()) {
            out.extend(self.fetch_window(symbol, timeframe, start, end).await?);
        }
        Ok(out)
    }

    /// Completed candles from `since_ts` up to now, for warmup.
    async fn fetch_recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ts: i64,
    ) -> Result<Vec<Candle>, ApiError> {
        self.fetch_range(symbol, timeframe, since_ts, Utc::now().timestamp())
            .await
    }
}

// ---------------------------------------------------------------------------
// Shared decode helpers
// ---------------------------------------------------------------------------

/// Reduce an epoch timestamp of unknown precision to seconds. Precision is
/// detected by digit count: 10 digits = seconds, 13 = milliseconds,
/// 16 = microseconds, with a magnitude heuristic for anything else.
pub fn ts_to_seconds(ts: i64) -> i64 {
    let digits = if ts <= 0 {
        1
    } else {
        (ts as f64).log10() as u32 + 1
    };
    let divisor = match digits {
        10 => 1,
        13 => 1_000,
        16 => 1_000_000,
        d if d >= 16 => 1_000_000,
        d if d >= 13 => 1_000,
        _ => 1,
    };
    ts / divisor
}

/// Split `[from_ts, to_ts]` into windows of at most `limit` candles each.
/// Bounds are inclusive seconds; each window starts where the previous one
/// ended plus one candle.
pub fn split_windows(
    from_ts: i64,
    to_ts: i64,
    timeframe: Timeframe,
    limit: usize,
) -> Vec<(i64, i64)> {
    let dur = match timeframe.fixed_duration_secs() {
        Some(d) => d,
        // Monthly ranges are short enough for a single window.
        None => return vec![(from_ts, to_ts)],
    };
    let span = dur * limit as i64;
    let mut windows = Vec::new();
    let mut start = from_ts;
    while start <= to_ts {
        let end = (start + span - 1).min(to_ts);
        windows.push((start, end));
        start = end + 1;
    }
    windows
}

/// Extract a price/volume field that may arrive as a JSON string or number.
pub fn field_f64(value: &Value, field: &'static str) -> Result<f64, NormalizeError> {
    let v = match value {
        Value::String(s) => s.parse::<f64>().map_err(|e| NormalizeError::InvalidField {
            field,
            reason: e.to_string(),
        })?,
        Value::Number(n) => n.as_f64().ok_or(NormalizeError::MissingField(field))?,
        Value::Null => return Err(NormalizeError::MissingField(field)),
        other => {
            return Err(NormalizeError::InvalidField {
                field,
                reason: format!("unexpected type: {other}"),
            })
        }
    };
    if !v.is_finite() {
        return Err(NormalizeError::InvalidField {
            field,
            reason: "not finite".into(),
        });
    }
    Ok(v)
}

/// Extract an integer timestamp that may arrive as a JSON string or number.
pub fn field_i64(value: &Value, field: &'static str) -> Result<i64, NormalizeError> {
    match value {
        Value::String(s) => s.parse::<i64>().map_err(|e| NormalizeError::InvalidField {
            field,
            reason: e.to_string(),
        }),
        Value::Number(n) => n.as_i64().ok_or(NormalizeError::MissingField(field)),
        _ => Err(NormalizeError::MissingField(field)),
    }
}

pub fn field_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, NormalizeError> {
    value.as_str().ok_or(NormalizeError::MissingField(field))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_precision_by_digit_count() {
        assert_eq!(ts_to_seconds(1_700_000_000), 1_700_000_000);
        assert_eq!(ts_to_seconds(1_700_000_000_000), 1_700_000_000);
        assert_eq!(ts_to_seconds(1_700_000_000_000_000), 1_700_000_000);
    }

    #[test]
    fn ts_precision_heuristic_fallback() {
        // 14 digits: closer to milliseconds.
        assert_eq!(ts_to_seconds(17_000_000_000_000), 17_000_000_000);
        // 11 digits: no clean mapping, treated as seconds.
        assert_eq!(ts_to_seconds(17_000_000_000), 17_000_000_000);
    }

    #[test]
    fn windows_cover_range_without_overlap() {
        // One day of 1m candles with a 1000-candle limit: 1440 candles in
        // two windows.
        let from = 1_727_740_800; // 2024-10-01 00:00:00 UTC
        let to = from + 86_400 - 1;
        let windows = split_windows(from, to, Timeframe::M1, 1000);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], (from, from + 60_000 - 1));
        assert_eq!(windows[1], (from + 60_000, to));

        // Windows chain exactly.
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn single_window_when_range_fits() {
        let from = 1_700_000_000;
        let windows = split_windows(from, from + 600, Timeframe::M1, 1000);
        assert_eq!(windows, vec![(from, from + 600)]);
    }

    #[test]
    fn field_f64_accepts_strings_and_numbers() {
        assert_eq!(field_f64(&serde_json::json!("1.5"), "o").unwrap(), 1.5);
        assert_eq!(field_f64(&serde_json::json!(2.5), "o").unwrap(), 2.5);
        assert!(field_f64(&serde_json::json!(null), "o").is_err());
        assert!(field_f64(&serde_json::json!("abc"), "o").is_err());
    }
}
