// =============================================================================
// Binance — kline websocket adapter and klines REST client
// =============================================================================
//
// WS uses combined streams: the subscription is encoded in the URL
// (`?streams=btcusdt@kline_1m/...`) so no subscribe frame is sent. Market
// type selects between spot, USD-margined and coin-margined endpoints, each
// with its own rate-limit pool.
// =============================================================================

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::candle::Candle;
use crate::error::{ApiError, NormalizeError};
use crate::exchange::{field_f64, field_i64, ts_to_seconds, CandleApi, WsAdapter};
use crate::input::{MarketType, StreamInput};
use crate::limiter::RateLimiter;
use crate::timeframe::Timeframe;

pub const SOURCE: &str = "binance";

const WS_SPOT: &str = "wss://stream.binance.com/stream";
const WS_USD_FUTURES: &str = "wss://fstream.binance.com/stream";
const WS_COIN_FUTURES: &str = "wss://dstream.binance.com/stream";

const REST_SPOT: &str = "https://api.binance.com/api/v3/klines";
const REST_USD_FUTURES: &str = "https://fapi.binance.com/fapi/v1/klines";
const REST_COIN_FUTURES: &str = "https://dapi.binance.com/dapi/v1/klines";

/// Sleep after an HTTP 429 before retrying. Binance bans aggressively, so
/// the wait is a full limit window.
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

fn ws_base(market: MarketType) -> &'static str {
    match market {
        MarketType::UsdFutures | MarketType::Linear => WS_USD_FUTURES,
        MarketType::CoinFutures | MarketType::Inverse => WS_COIN_FUTURES,
        _ => WS_SPOT,
    }
}

fn rest_base(market: MarketType) -> &'static str {
    match market {
        MarketType::UsdFutures | MarketType::Linear => REST_USD_FUTURES,
        MarketType::CoinFutures | MarketType::Inverse => REST_COIN_FUTURES,
        _ => REST_SPOT,
    }
}

/// One limiter per market type; instances of [`BinanceApi`] for the same
/// market share the pool.
fn limiter(market: MarketType) -> Arc<RateLimiter> {
    static SPOT: OnceLock<Arc<RateLimiter>> = OnceLock::new();
    static USDM: OnceLock<Arc<RateLimiter>> = OnceLock::new();
    static COINM: OnceLock<Arc<RateLimiter>> = OnceLock::new();

    let cell = match market {
        MarketType::UsdFutures | MarketType::Linear => &USDM,
        MarketType::CoinFutures | MarketType::Inverse => &COINM,
        _ => &SPOT,
    };
    cell.get_or_init(|| Arc::new(RateLimiter::new(1000, Duration::from_secs(60))))
        .clone()
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Decode a kline websocket frame. Handles both the combined-stream envelope
/// (`{"stream": ..., "data": {...}}`) and a direct payload. Subscription
/// acks (`{"result": null, "id": 1}`) and non-kline events map to `None`.
pub fn from_ws(value: &Value) -> Result<Option<Candle>, NormalizeError> {
    let data = match value.get("data") {
        Some(d) => d,
        None => value,
    };

    match data.get("e").and_then(Value::as_str) {
        Some("kline") => {}
        _ => return Ok(None),
    }

    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("s"))?
        .to_uppercase();

    let k = data.get("k").ok_or(NormalizeError::MissingField("k"))?;

    let timeframe = k
        .get("i")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("k.i"))
        .and_then(|s| {
            Timeframe::parse(s).map_err(|_| NormalizeError::InvalidField {
                field: "k.i",
                reason: format!("unknown interval `{s}`"),
            })
        })?;

    let open_ts = ts_to_seconds(field_i64(
        k.get("t").unwrap_or(&Value::Null),
        "k.t",
    )?);
    let end_ts = ts_to_seconds(field_i64(
        k.get("T").unwrap_or(&Value::Null),
        "k.T",
    )?);

    let candle = Candle {
        source: SOURCE.into(),
        symbol,
        timeframe,
        open_ts,
        end_ts,
        open: field_f64(k.get("o").unwrap_or(&Value::Null), "k.o")?,
        high: field_f64(k.get("h").unwrap_or(&Value::Null), "k.h")?,
        low: field_f64(k.get("l").unwrap_or(&Value::Null), "k.l")?,
        close: field_f64(k.get("c").unwrap_or(&Value::Null), "k.c")?,
        volume: field_f64(k.get("v").unwrap_or(&Value::Null), "k.v")?,
        quote_volume: Some(field_f64(k.get("q").unwrap_or(&Value::Null), "k.q")?),
        is_closed: k
            .get("x")
            .and_then(Value::as_bool)
            .ok_or(NormalizeError::MissingField("k.x"))?,
        count: None,
    };

    candle.validate()?;
    Ok(Some(candle))
}

/// Decode one row of a klines REST response. Rows are 12-element arrays:
/// `[0]` open time (ms), `[1..4]` OHLC, `[5]` volume, `[6]` close time (ms),
/// `[7]` quote volume, rest ignored.
pub fn from_rest(row: &Value, symbol: &str, timeframe: Timeframe) -> Result<Candle, NormalizeError> {
    let arr = row.as_array().ok_or(NormalizeError::MissingField("row"))?;
    if arr.len() < 8 {
        return Err(NormalizeError::InvalidField {
            field: "row",
            reason: format!("expected 12 elements, got {}", arr.len()),
        });
    }

    let candle = Candle {
        source: SOURCE.into(),
        symbol: symbol.to_uppercase(),
        timeframe,
        open_ts: ts_to_seconds(field_i64(&arr[0], "open_ts")?),
        end_ts: ts_to_seconds(field_i64(&arr[6], "end_ts")?),
        open: field_f64(&arr[1], "open")?,
        high: field_f64(&arr[2], "high")?,
        low: field_f64(&arr[3], "low")?,
        close: field_f64(&arr[4], "close")?,
        volume: field_f64(&arr[5], "volume")?,
        quote_volume: Some(field_f64(&arr[7], "quote_volume")?),
        is_closed: true,
        count: None,
    };

    candle.validate()?;
    Ok(candle)
}

// ---------------------------------------------------------------------------
// Websocket adapter
// ---------------------------------------------------------------------------

pub struct BinanceWs {
    market: MarketType,
}

impl BinanceWs {
    pub fn new(market: MarketType) -> Self {
        Self { market }
    }
}

impl WsAdapter for BinanceWs {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn ws_url(&self, input: &StreamInput) -> String {
        let streams: Vec<String> = input
            .symbols
            .iter()
            .map(|sym| format!("{}@kline_{}", sym.to_lowercase(), input.timeframe))
            .collect();
        format!("{}?streams={}", ws_base(self.market), streams.join("/"))
    }

    fn subscribe_frames(&self, _input: &StreamInput) -> Vec<String> {
        // Combined streams subscribe via the URL.
        Vec::new()
    }

    fn normalize_ws(&self, value: &Value) -> Result<Option<Candle>, NormalizeError> {
        from_ws(value)
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct BinanceApi {
    client: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl BinanceApi {
    pub fn new(market: MarketType) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: rest_base(market).to_string(),
            limiter: limiter(market),
        }
    }
}

#[async_trait]
impl CandleApi for BinanceApi {
    fn source(&self) -> &'static str {
        SOURCE
    }

    async fn fetch_window(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>, ApiError> {
        let url = format!(
            "{}?symbol={}&interval={}&limit={}&startTime={}&endTime={}",
            self.base_url,
            symbol.to_uppercase(),
            timeframe,
            self.window_limit(),
            from_ts * 1000,
            to_ts * 1000,
        );

        loop {
            self.limiter.acquire().await;
            let resp = self.client.get(&url).send().await?;
            let status = resp.status();

            if status.as_u16() == 429 {
                warn!(
                    pause_s = RATE_LIMIT_PAUSE.as_secs(),
                    "binance rate limit exceeded, backing off"
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
            let rows = body
                .as_array()
                .ok_or_else(|| ApiError::BadResponse("klines response is not an array".into()))?;

            let mut candles = Vec::with_capacity(rows.len());
            for row in rows {
                match from_rest(row, symbol, timeframe) {
                    Ok(c) => candles.push(c),
                    Err(e) => warn!(error = %e, "skipping malformed kline row"),
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

    #[test]
    fn ws_kline_frame_normalizes() {
        let frame = serde_json::json!({
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline",
                "s": "BTCUSDT",
                "k": {
                    "t": 1_700_000_000_000_i64,
                    "T": 1_700_000_059_999_i64,
                    "i": "1m",
                    "o": "1",
                    "h": "2",
                    "l": "0.5",
                    "c": "1.5",
                    "v": "10",
                    "q": "15",
                    "x": true
                }
            }
        });

        let c = from_ws(&frame).unwrap().expect("data frame");
        assert_eq!(c.source, "binance");
        assert_eq!(c.symbol, "BTCUSDT");
        assert_eq!(c.timeframe, Timeframe::M1);
        assert_eq!(c.open_ts, 1_700_000_000);
        assert_eq!(c.end_ts, 1_700_000_059);
        assert_eq!(c.open, 1.0);
        assert_eq!(c.high, 2.0);
        assert_eq!(c.low, 0.5);
        assert_eq!(c.close, 1.5);
        assert_eq!(c.volume, 10.0);
        assert_eq!(c.quote_volume, Some(15.0));
        assert!(c.is_closed);
    }

    #[test]
    fn ws_normalization_is_idempotent() {
        let frame = serde_json::json!({
            "e": "kline",
            "s": "ETHUSDT",
            "k": {
                "t": 1_700_000_000_000_i64,
                "T": 1_700_000_059_999_i64,
                "i": "1m",
                "o": "10", "h": "11", "l": "9", "c": "10.5",
                "v": "3", "q": "31.5", "x": false
            }
        });
        let a = from_ws(&frame).unwrap().unwrap();
        let b = from_ws(&frame).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ws_ack_and_foreign_events_filtered() {
        assert!(from_ws(&serde_json::json!({"result": null, "id": 1}))
            .unwrap()
            .is_none());
        assert!(
            from_ws(&serde_json::json!({"e": "aggTrade", "s": "BTCUSDT"}))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn ws_malformed_data_frame_errors() {
        // A kline frame with a hole in it must error, not pass through.
        let frame = serde_json::json!({
            "e": "kline",
            "s": "BTCUSDT",
            "k": {"t": 1_700_000_000_000_i64, "T": 1_700_000_059_999_i64, "i": "1m"}
        });
        assert!(from_ws(&frame).is_err());
    }

    #[test]
    fn rest_row_normalizes() {
        let row = serde_json::json!([
            1_700_000_000_000_i64,
            "1", "2", "0.5", "1.5", "10",
            1_700_000_059_999_i64,
            "15",
            100, "5", "7.5", "0"
        ]);
        let c = from_rest(&row, "btcusdt", Timeframe::M1).unwrap();
        assert_eq!(c.symbol, "BTCUSDT");
        assert_eq!(c.open_ts, 1_700_000_000);
        assert_eq!(c.end_ts, 1_700_000_059);
        assert_eq!(c.quote_volume, Some(15.0));
        assert!(c.is_closed);
    }

    #[test]
    fn rest_short_row_rejected() {
        let row = serde_json::json!([1_700_000_000_000_i64, "1", "2"]);
        assert!(from_rest(&row, "BTCUSDT", Timeframe::M1).is_err());
    }

    #[test]
    fn combined_stream_url() {
        let ws = BinanceWs::new(MarketType::Default);
        let input = StreamInput::new(
            crate::input::StreamKind::Kline,
            vec!["BTCUSDT".into(), "ETHUSDT".into()],
            Timeframe::M1,
        );
        assert_eq!(
            ws.ws_url(&input),
            "wss://stream.binance.com/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m"
        );
        assert!(ws.subscribe_frames(&input).is_empty());
    }

    #[test]
    fn futures_urls_by_market_type() {
        let ws = BinanceWs::new(MarketType::UsdFutures);
        let input = StreamInput::new(
            crate::input::StreamKind::Kline,
            vec!["BTCUSDT".into()],
            Timeframe::M5,
        );
        assert!(ws.ws_url(&input).starts_with("wss://fstream.binance.com/"));
        assert_eq!(rest_base(MarketType::CoinFutures), REST_COIN_FUTURES);
    }
}
