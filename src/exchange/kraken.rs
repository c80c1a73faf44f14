// =============================================================================
// Kraken — v1 ohlc websocket adapter and public OHLC REST client
// =============================================================================
//
// Kraken's v1 feed wraps channel data in arrays:
// `[channelID, payload, "ohlc-<min>", "XBT/USD"]` with the payload itself a
// positional array `[time, etime, open, high, low, close, vwap, volume,
// count]` of string-encoded numbers. `etime` is the interval's end boundary
// in seconds (fractional), so `open_ts = end_ts - duration + 1` with the
// inclusive `end_ts = etime - 1`.
//
// Kraken sends no confirm flag. A candle is treated as closed once its
// interval end lies in the past at decode time; an in-progress interval is
// emitted open and overwritten in place downstream.
// =============================================================================

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::candle::Candle;
use crate::error::{ApiError, NormalizeError};
use crate::exchange::{field_f64, ts_to_seconds, CandleApi, WsAdapter};
use crate::input::{MarketType, StreamInput};
use crate::limiter::RateLimiter;
use crate::timeframe::Timeframe;

pub const SOURCE: &str = "kraken";

const WS_PUBLIC: &str = "wss://ws.kraken.com";
const REST_OHLC: &str = "https://api.kraken.com/0/public/OHLC";

const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(10);

fn limiter() -> Arc<RateLimiter> {
    static SHARED: OnceLock<Arc<RateLimiter>> = OnceLock::new();
    SHARED
        .get_or_init(|| Arc::new(RateLimiter::new(1, Duration::from_secs(1))))
        .clone()
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Seconds-as-float wire timestamp ("1542057314.748456") to whole seconds.
fn float_ts(value: &Value, field: &'static str) -> Result<i64, NormalizeError> {
    let raw = field_f64(value, field)?;
    if raw > 1e11 {
        // Already sub-second precision as a plain number.
        return Ok(ts_to_seconds(raw as i64));
    }
    Ok(raw as i64)
}

/// Decode an ohlc channel message at a fixed `now` (injected for tests).
pub fn from_ws_at(value: &Value, now_ts: i64) -> Result<Option<Candle>, NormalizeError> {
    // Event objects: heartbeats, system status, subscription acks.
    if value.is_object() {
        return Ok(None);
    }

    let arr = match value.as_array() {
        Some(a) if a.len() >= 4 => a,
        _ => return Ok(None),
    };

    let channel = arr[arr.len() - 2].as_str().unwrap_or("");
    let Some(min_str) = channel.strip_prefix("ohlc-") else {
        return Ok(None);
    };
    let minutes: i64 = min_str.parse().map_err(|_| NormalizeError::InvalidField {
        field: "channelName",
        reason: format!("bad interval `{min_str}`"),
    })?;
    let timeframe = timeframe_from_minutes(minutes)?;
    let duration = timeframe
        .fixed_duration_secs()
        .ok_or(NormalizeError::MissingField("duration"))?;

    let symbol = arr[arr.len() - 1]
        .as_str()
        .ok_or(NormalizeError::MissingField("pair"))?
        .to_string();

    let payload = arr[1]
        .as_array()
        .ok_or(NormalizeError::MissingField("payload"))?;
    if payload.len() < 8 {
        return Err(NormalizeError::InvalidField {
            field: "payload",
            reason: format!("expected at least 8 elements, got {}", payload.len()),
        });
    }

    // payload[1] is the interval end boundary (exclusive), seconds as float.
    let boundary = float_ts(&payload[1], "etime")?;
    let end_ts = boundary - 1;
    let open_ts = boundary - duration;

    let candle = Candle {
        source: SOURCE.into(),
        symbol,
        timeframe,
        open_ts,
        end_ts,
        open: field_f64(&payload[2], "open")?,
        high: field_f64(&payload[3], "high")?,
        low: field_f64(&payload[4], "low")?,
        close: field_f64(&payload[5], "close")?,
        volume: field_f64(&payload[7], "volume")?,
        quote_volume: None,
        is_closed: end_ts < now_ts,
        count: None,
    };

    candle.validate()?;
    Ok(Some(candle))
}

pub fn from_ws(value: &Value) -> Result<Option<Candle>, NormalizeError> {
    from_ws_at(value, Utc::now().timestamp())
}

/// Decode one row of a public OHLC REST response:
/// `[time, open, high, low, close, vwap, volume, count]` with `time` the
/// interval start in seconds.
pub fn from_rest(row: &Value, symbol: &str, timeframe: Timeframe) -> Result<Candle, NormalizeError> {
    let arr = row.as_array().ok_or(NormalizeError::MissingField("row"))?;
    if arr.len() < 8 {
        return Err(NormalizeError::InvalidField {
            field: "row",
            reason: format!("expected 8 elements, got {}", arr.len()),
        });
    }

    let open_ts = float_ts(&arr[0], "time")?;
    let candle = Candle {
        source: SOURCE.into(),
        symbol: symbol.to_string(),
        timeframe,
        open_ts,
        end_ts: timeframe.end_ts_from_open(open_ts),
        open: field_f64(&arr[1], "open")?,
        high: field_f64(&arr[2], "high")?,
        low: field_f64(&arr[3], "low")?,
        close: field_f64(&arr[4], "close")?,
        volume: field_f64(&arr[6], "volume")?,
        quote_volume: None,
        is_closed: true,
        count: None,
    };

    candle.validate()?;
    Ok(candle)
}

fn timeframe_from_minutes(minutes: i64) -> Result<Timeframe, NormalizeError> {
    Timeframe::ALL
        .iter()
        .copied()
        .find(|tf| tf.minutes() == Some(minutes))
        .ok_or(NormalizeError::InvalidField {
            field: "interval",
            reason: format!("no timeframe spans {minutes} minutes"),
        })
}

// ---------------------------------------------------------------------------
// Websocket adapter
// ---------------------------------------------------------------------------

pub struct KrakenWs;

impl KrakenWs {
    pub fn new(_market: MarketType) -> Self {
        Self
    }
}

impl WsAdapter for KrakenWs {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn ws_url(&self, _input: &StreamInput) -> String {
        WS_PUBLIC.to_string()
    }

    fn subscribe_frames(&self, input: &StreamInput) -> Vec<String> {
        let minutes = input.timeframe.minutes().unwrap_or(1);
        vec![serde_json::json!({
            "event": "subscribe",
            "pair": input.symbols,
            "subscription": {"name": "ohlc", "interval": minutes},
        })
        .to_string()]
    }

    fn normalize_ws(&self, value: &Value) -> Result<Option<Candle>, NormalizeError> {
        from_ws(value)
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct KrakenApi {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl KrakenApi {
    pub fn new(_market: MarketType) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            limiter: limiter(),
        }
    }
}

#[async_trait]
impl CandleApi for KrakenApi {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn window_limit(&self) -> usize {
        // The OHLC endpoint returns at most 720 rows per call.
        720
    }

    async fn fetch_window(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>, ApiError> {
        let minutes = timeframe.minutes().unwrap_or(1);
        // `since` is exclusive.
        let url = format!(
            "{}?pair={}&interval={}&since={}",
            REST_OHLC,
            symbol,
            minutes,
            from_ts - 1,
        );

        loop {
            self.limiter.acquire().await;
            let resp = self.client.get(&url).send().await?;
            let status = resp.status();

            if status.as_u16() == 429 {
                warn!(
                    pause_s = RATE_LIMIT_PAUSE.as_secs(),
                    "kraken rate limit exceeded, backing off"
                );
                tokio::time::sleep(RATE_LIMIT_PAUSE).await;
                continue;
            }
            if matches!(status.as_u16(), 418 | 403) {
                return Err(ApiError::Banned {
                    exchange: SOURCE,
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                return Err(ApiError::Http {
                    exchange: SOURCE,
                    status: status.as_u16(),
                    url,
                });
            }

            let body: Value = resp.json().await?;
            if let Some(errors) = body.get("error").and_then(Value::as_array) {
                if !errors.is_empty() {
                    return Err(ApiError::BadResponse(format!("{errors:?}")));
                }
            }

            let result = body
                .get("result")
                .and_then(Value::as_object)
                .ok_or_else(|| ApiError::BadResponse("missing result".into()))?;

            // The result object holds the rows under Kraken's normalized
            // pair name plus a "last" cursor.
            let rows = result
                .iter()
                .find(|(k, _)| k.as_str() != "last")
                .and_then(|(_, v)| v.as_array())
                .ok_or_else(|| ApiError::BadResponse("missing pair rows".into()))?;

            let mut candles = Vec::with_capacity(rows.len());
            for row in rows {
                match from_rest(row, symbol, timeframe) {
                    Ok(c) if c.open_ts >= from_ts && c.open_ts <= to_ts => candles.push(c),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "skipping malformed ohlc row"),
                }
            }
            return Ok(candles);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ohlc_message() -> Value {
        serde_json::json!([
            42,
            [
                "1700000030.123456",
                "1700000060.000000",
                "100.0", "102.0", "99.0", "101.0",
                "100.5", "5.0", 12
            ],
            "ohlc-1",
            "XBT/USD"
        ])
    }

    #[test]
    fn ohlc_message_normalizes() {
        // Interval boundary at 1_700_000_060: the candle covers
        // [1_700_000_000, 1_700_000_059].
        let c = from_ws_at(&ohlc_message(), 1_700_000_100)
            .unwrap()
            .expect("data frame");
        assert_eq!(c.source, "kraken");
        assert_eq!(c.symbol, "XBT/USD");
        assert_eq!(c.timeframe, Timeframe::M1);
        assert_eq!(c.open_ts, 1_700_000_000);
        assert_eq!(c.end_ts, 1_700_000_059);
        assert_eq!(c.volume, 5.0);
        assert_eq!(c.quote_volume, None);
    }

    #[test]
    fn closed_iff_interval_end_is_past() {
        // Now before the boundary: still in progress.
        let open = from_ws_at(&ohlc_message(), 1_700_000_030).unwrap().unwrap();
        assert!(!open.is_closed);
        // Now at the boundary: end_ts (boundary - 1) is in the past.
        let closed = from_ws_at(&ohlc_message(), 1_700_000_060).unwrap().unwrap();
        assert!(closed.is_closed);
    }

    #[test]
    fn event_objects_filtered() {
        for event in [
            serde_json::json!({"event": "heartbeat"}),
            serde_json::json!({"event": "systemStatus", "status": "online"}),
            serde_json::json!({
                "event": "subscriptionStatus",
                "status": "subscribed",
                "channelName": "ohlc-1",
                "pair": "XBT/USD"
            }),
        ] {
            assert!(from_ws_at(&event, 1_700_000_000).unwrap().is_none());
        }
    }

    #[test]
    fn other_channels_filtered() {
        let trade = serde_json::json!([7, [["100.0", "0.1", "1700000000.0", "b", "l", ""]], "trade", "XBT/USD"]);
        assert!(from_ws_at(&trade, 1_700_000_000).unwrap().is_none());
    }

    #[test]
    fn rest_row_time_is_interval_start() {
        let row = serde_json::json!([
            1_700_000_000, "100.0", "102.0", "99.0", "101.0", "100.5", "5.0", 12
        ]);
        let c = from_rest(&row, "XBT/USD", Timeframe::M1).unwrap();
        assert_eq!(c.open_ts, 1_700_000_000);
        assert_eq!(c.end_ts, 1_700_000_059);
        assert!(c.is_closed);
    }

    #[test]
    fn subscribe_frame_shape() {
        let ws = KrakenWs::new(MarketType::Default);
        let input = StreamInput::new(
            crate::input::StreamKind::Ohlc,
            vec!["XBT/USD".into(), "ETH/USD".into()],
            Timeframe::M5,
        );
        let frames = ws.subscribe_frames(&input);
        assert_eq!(
            frames[0],
            r#"{"event":"subscribe","pair":["XBT/USD","ETH/USD"],"subscription":{"name":"ohlc","interval":5}}"#
        );
    }
}
