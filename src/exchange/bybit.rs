// =============================================================================
// Bybit — v5 kline websocket adapter and market/kline REST client
// =============================================================================
//
// Topic-based subscriptions ("kline.1.BTCUSDT") carry the symbol and
// interval, so the normalizer recovers both from the topic string. The REST
// endpoint is shared across spot/linear/inverse (only the `category` query
// parameter differs), so one rate limiter is shared across all market types.
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

pub const SOURCE: &str = "bybit";

const WS_BASE: &str = "wss://stream.bybit.com/v5/public";
const REST_KLINE: &str = "https://api.bybit.com/v5/market/kline";

/// Bybit recovers quickly; a short pause after a 429 is enough.
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(5);

/// Keepalive interval. Bybit drops connections that stay silent for much
/// longer than 30 s.
const PING_INTERVAL: Duration = Duration::from_secs(20);

fn category(market: MarketType) -> &'static str {
    match market {
        MarketType::Linear | MarketType::UsdFutures => "linear",
        MarketType::Inverse | MarketType::CoinFutures => "inverse",
        _ => "spot",
    }
}

/// Single limiter shared across every market type: the quota lives on the
/// shared endpoint, not on the category.
fn limiter() -> Arc<RateLimiter> {
    static SHARED: OnceLock<Arc<RateLimiter>> = OnceLock::new();
    SHARED
        .get_or_init(|| Arc::new(RateLimiter::new(20, Duration::from_secs(1))))
        .clone()
}

/// Canonical timeframe to Bybit's interval spelling.
pub fn interval(tf: Timeframe) -> &'static str {
    match tf {
        Timeframe::M1 => "1",
        Timeframe::M3 => "3",
        Timeframe::M5 => "5",
        Timeframe::M15 => "15",
        Timeframe::M30 => "30",
        Timeframe::H1 => "60",
        Timeframe::H2 => "120",
        Timeframe::H4 => "240",
        Timeframe::D1 => "D",
        Timeframe::W1 => "W",
        Timeframe::Mo1 => "M",
    }
}

fn interval_to_timeframe(iv: &str) -> Result<Timeframe, NormalizeError> {
    let tf = match iv {
        "1" => Timeframe::M1,
        "3" => Timeframe::M3,
        "5" => Timeframe::M5,
        "15" => Timeframe::M15,
        "30" => Timeframe::M30,
        "60" => Timeframe::H1,
        "120" => Timeframe::H2,
        "240" => Timeframe::H4,
        "D" => Timeframe::D1,
        "W" => Timeframe::W1,
        "M" => Timeframe::Mo1,
        other => {
            return Err(NormalizeError::InvalidField {
                field: "topic",
                reason: format!("unknown interval `{other}`"),
            })
        }
    };
    Ok(tf)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Decode a kline push. Operational frames (`{"op": "subscribe"}` acks and
/// `{"op": "pong"}`) and non-kline topics map to `None`.
pub fn from_ws(value: &Value) -> Result<Option<Candle>, NormalizeError> {
    if value.get("op").is_some() || value.get("success").is_some() {
        return Ok(None);
    }

    let topic = match value.get("topic").and_then(Value::as_str) {
        Some(t) => t,
        None => return Ok(None),
    };
    let mut parts = topic.split('.');
    if parts.next() != Some("kline") {
        return Ok(None);
    }
    let iv = parts.next().ok_or(NormalizeError::MissingField("topic"))?;
    let symbol = parts
        .next()
        .ok_or(NormalizeError::MissingField("topic"))?
        .to_uppercase();
    let timeframe = interval_to_timeframe(iv)?;

    let entry = value
        .get("data")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or(NormalizeError::MissingField("data"))?;

    let open_ts = ts_to_seconds(field_i64(
        entry.get("start").unwrap_or(&Value::Null),
        "start",
    )?);
    let end_ts = ts_to_seconds(field_i64(entry.get("end").unwrap_or(&Value::Null), "end")?);

    let candle = Candle {
        source: SOURCE.into(),
        symbol,
        timeframe,
        open_ts,
        end_ts,
        open: field_f64(entry.get("open").unwrap_or(&Value::Null), "open")?,
        high: field_f64(entry.get("high").unwrap_or(&Value::Null), "high")?,
        low: field_f64(entry.get("low").unwrap_or(&Value::Null), "low")?,
        close: field_f64(entry.get("close").unwrap_or(&Value::Null), "close")?,
        volume: field_f64(entry.get("volume").unwrap_or(&Value::Null), "volume")?,
        quote_volume: Some(field_f64(
            entry.get("turnover").unwrap_or(&Value::Null),
            "turnover",
        )?),
        is_closed: entry
            .get("confirm")
            .and_then(Value::as_bool)
            .ok_or(NormalizeError::MissingField("confirm"))?,
        count: None,
    };

    candle.validate()?;
    Ok(Some(candle))
}

/// Decode one row of a kline REST response: a 7-element array
/// `[start(ms), open, high, low, close, volume, turnover]`. The end
/// timestamp is computed because the wire omits it.
pub fn from_rest(row: &Value, symbol: &str, timeframe: Timeframe) -> Result<Candle, NormalizeError> {
    let arr = row.as_array().ok_or(NormalizeError::MissingField("row"))?;
    if arr.len() < 7 {
        return Err(NormalizeError::InvalidField {
            field: "row",
            reason: format!("expected 7 elements, got {}", arr.len()),
        });
    }

    let open_ts = ts_to_seconds(field_i64(&arr[0], "start")?);
    let candle = Candle {
        source: SOURCE.into(),
        symbol: symbol.to_uppercase(),
        timeframe,
        open_ts,
        end_ts: timeframe.end_ts_from_open(open_ts),
        open: field_f64(&arr[1], "open")?,
        high: field_f64(&arr[2], "high")?,
        low: field_f64(&arr[3], "low")?,
        close: field_f64(&arr[4], "close")?,
        volume: field_f64(&arr[5], "volume")?,
        quote_volume: Some(field_f64(&arr[6], "turnover")?),
        is_closed: true,
        count: None,
    };

    candle.validate()?;
    Ok(candle)
}

// ---------------------------------------------------------------------------
// Websocket adapter
// ---------------------------------------------------------------------------

pub struct BybitWs {
    market: MarketType,
}

impl BybitWs {
    pub fn new(market: MarketType) -> Self {
        Self { market }
    }
}

impl WsAdapter for BybitWs {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn ws_url(&self, _input: &StreamInput) -> String {
        format!("{}/{}", WS_BASE, category(self.market))
    }

    fn subscribe_frames(&self, input: &StreamInput) -> Vec<String> {
        let args: Vec<String> = input
            .symbols
            .iter()
            .map(|sym| {
                format!(
                    "kline.{}.{}",
                    interval(input.timeframe),
                    sym.to_uppercase()
                )
            })
            .collect();
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn ping_frame(&self) -> Option<String> {
        Some(serde_json::json!({"op": "ping"}).to_string())
    }

    fn ping_interval(&self) -> Duration {
        PING_INTERVAL
    }

    fn normalize_ws(&self, value: &Value) -> Result<Option<Candle>, NormalizeError> {
        from_ws(value)
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct BybitApi {
    client: reqwest::Client,
    category: &'static str,
    limiter: Arc<RateLimiter>,
}

impl BybitApi {
    pub fn new(market: MarketType) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            category: category(market),
            limiter: limiter(),
        }
    }
}

#[async_trait]
impl CandleApi for BybitApi {
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
            "{}?category={}&symbol={}&interval={}&limit={}&start={}&end={}",
            REST_KLINE,
            self.category,
            symbol.to_uppercase(),
            interval(timeframe),
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
                    "bybit rate limit exceeded, backing off"
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
            let ret_code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
            if ret_code != 0 {
                let msg = body
                    .get("retMsg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                if msg.to_lowercase().contains("rate limit")
                    || msg.to_lowercase().contains("too many")
                {
                    warn!(ret_msg = msg, "bybit throttled at the application level");
                    tokio::time::sleep(RATE_LIMIT_PAUSE).await;
                    continue;
                }
                return Err(ApiError::BadResponse(format!(
                    "retCode {ret_code}: {msg}"
                )));
            }

            let list = body
                .pointer("/result/list")
                .and_then(Value::as_array)
                .ok_or_else(|| ApiError::BadResponse("missing result.list".into()))?;

            // Rows come back newest-first; reverse each window to
            // chronological order.
            let mut candles = Vec::with_capacity(list.len());
            for row in list.iter().rev() {
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
