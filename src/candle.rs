// =============================================================================
// Canonical candle — the single record flowing through the engine
// =============================================================================
//
// Every exchange message is normalized into this shape before anything else
// touches it. Timestamps are UTC seconds; `end_ts` is inclusive, so
// `end_ts - open_ts + 1` equals the timeframe duration.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::NormalizeError;
use crate::timeframe::Timeframe;

/// One OHLCV bar from a single exchange, symbol, and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Exchange name, lowercase (e.g. "binance").
    pub source: String,
    /// Exchange-native symbol (e.g. "BTCUSDT", "BTC-USDT", "BTC/USD").
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Start of the interval, seconds since epoch (UTC).
    pub open_ts: i64,
    /// Inclusive end of the interval, seconds since epoch (UTC).
    pub end_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base-asset volume.
    pub volume: f64,
    /// Quote-asset volume, when the exchange reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_volume: Option<f64>,
    /// True once the exchange declares the bar final, or when aggregation
    /// emits a completed bucket.
    pub is_closed: bool,
    /// Number of base candles rolled into this one (1 for leaf candles).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Composite key identifying a unique candle series plus its slot in time.
/// This is the natural persistence key, which makes sink delivery idempotent.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub source: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_ts: i64,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}:{}",
            self.source, self.symbol, self.timeframe, self.open_ts
        )
    }
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            source: self.source.clone(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            open_ts: self.open_ts,
        }
    }

    /// Validate the record invariants. Called on every candle leaving a
    /// normalizer or the aggregator; violations drop the record, never the
    /// connection.
    pub fn validate(&self) -> Result<(), NormalizeError> {
        for (name, v) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if !v.is_finite() {
                return Err(NormalizeError::InvalidCandle(format!(
                    "{name} is not finite"
                )));
            }
        }
        if self.volume < 0.0 || !self.volume.is_finite() {
            return Err(NormalizeError::InvalidCandle("negative volume".into()));
        }
        if let Some(q) = self.quote_volume {
            if q < 0.0 || !q.is_finite() {
                return Err(NormalizeError::InvalidCandle(
                    "negative quote volume".into(),
                ));
            }
        }

        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if !(self.low <= body_low && body_high <= self.high) {
            return Err(NormalizeError::InvalidCandle(format!(
                "price order violated: low={} open={} close={} high={}",
                self.low, self.open, self.close, self.high
            )));
        }

        if self.open_ts >= self.end_ts {
            return Err(NormalizeError::InvalidCandle(format!(
                "open_ts {} not before end_ts {}",
                self.open_ts, self.end_ts
            )));
        }
        if let Some(dur) = self.timeframe.fixed_duration_secs() {
            if self.end_ts - self.open_ts + 1 != dur {
                return Err(NormalizeError::InvalidCandle(format!(
                    "interval {}s does not match {} ({}s)",
                    self.end_ts - self.open_ts + 1,
                    self.timeframe,
                    dur
                )));
            }
        }
        Ok(())
    }

    /// Canonical row form used by sinks and transformers: one entry per
    /// field, in declaration order, with the timeframe as its string form.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
