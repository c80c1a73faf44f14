// =============================================================================
// OKX — v5 candle websocket adapter and market/candles REST client
// =============================================================================
//
// OKX pushes candles as positional 9-element arrays on `candle<bar>`
// channels. The `confirm` flag arrives as the string "0"/"1", never as a
// boolean. REST rows share the same array shape and come back newest-first.
// =============================================================================

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::candle::Candle;
use crate::error::{ApiError, NormalizeError};
use crate::exchange::{field_f64, field_i64, field_str, ts_to_seconds, CandleApi, WsAdapter};
use crate::input::{MarketType, StreamInput};
use crate::limiter::RateLimiter;
use crate::timeframe::Timeframe;

pub const SOURCE: &str = "okx";

const WS_PUBLIC: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_CANDLES: &str = "https://www.okx.com/api/v5/market/candles";

const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(5);

fn limiter() -> Arc<RateLimiter> {
    static SHARED: OnceLock<Arc<RateLimiter>> = OnceLock::new();
    SHARED
        .get_or_init(|| Arc::new(RateLimiter::new(20, Duration::from_secs(2))))
        .clone()
}

/// Canonical timeframe to OKX's bar spelling. Minutes are lowercase, hours
/// and above are uppercase.
pub fn bar(tf: Timeframe) -> &'static str {
    match tf {
        Timeframe::M1 => "1m",
        Timeframe::M3 => "3m",
        Timeframe::M5 => "5m",
        Timeframe::M15 => "15m",
        Timeframe::M30 => "30m",
        Timeframe::H1 => "1H",
        Timeframe::H2 => "2H",
        Timeframe::H4 => "4H",
        Timeframe::D1 => "1D",
        Timeframe::W1 => "1W",
        Timeframe::Mo1 => "1M",
    }
}

fn bar_to_timeframe(b: &str) -> Result<Timeframe, NormalizeError> {
    let tf = match b {
        "1m" => Timeframe::M1,
        "3m" => Timeframe::M3,
        "5m" => Timeframe::M5,
        "15m" => Timeframe::M15,
        "30m" => Timeframe::M30,
        "1H" => Timeframe::H1,
        "2H" => Timeframe::H2,
        "4H" => Timeframe::H4,
        "1D" => Timeframe::D1,
        "1W" => Timeframe::W1,
        "1M" => Timeframe::Mo1,
        other => {
            return Err(NormalizeError::InvalidField {
                field: "channel",
                reason: format!("unknown bar `{other}`"),
            })
        }
    };
    Ok(tf)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn row_to_candle(
    row: &Value,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<Candle, NormalizeError> {
    let arr = row.as_array().ok_or(NormalizeError::MissingField("row"))?;
    if arr.len() < 9 {
        return Err(NormalizeError::InvalidField {
            field: "row",
            reason: format!("expected 9 elements, got {}", arr.len()),
        });
    }

    let open_ts = ts_to_seconds(field_i64(&arr[0], "ts")?);
    // The confirm flag is the string "0"/"1" on the wire.
    let is_closed = match field_str(&arr[8], "confirm")? {
        "1" => true,
        "0" => false,
        other => {
            return Err(NormalizeError::InvalidField {
                field: "confirm",
                reason: format!("expected \"0\" or \"1\", got `{other}`"),
            })
        }
    };

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
        volume: field_f64(&arr[5], "vol")?,
        quote_volume: Some(field_f64(&arr[7], "volCcyQuote")?),
        is_closed,
        count: None,
    };

    candle.validate()?;
    Ok(candle)
}

/// Decode a candle push. Event frames (subscribe acks, errors) and
/// non-candle channels map to `None`.
pub fn from_ws(value: &Value) -> Result<Option<Candle>, NormalizeError> {
    if value.get("event").is_some() {
        return Ok(None);
    }

    let arg = match value.get("arg") {
        Some(a) => a,
        None => return Ok(None),
    };
    let channel = arg.get("channel").and_then(Value::as_str).unwrap_or("");
    let Some(bar_str) = channel.strip_prefix("candle") else {
        return Ok(None);
    };
    let timeframe = bar_to_timeframe(bar_str)?;
    let symbol = field_str(
        arg.get("instId").unwrap_or(&Value::Null),
        "instId",
    )?;

    let row = value
        .get("data")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or(NormalizeError::MissingField("data"))?;

    row_to_candle(row, symbol, timeframe).map(Some)
}

/// Decode one REST row; same 9-element shape as the WS push.
pub fn from_rest(row: &Value, symbol: &str, timeframe: Timeframe) -> Result<Candle, NormalizeError> {
    row_to_candle(row, symbol, timeframe)
}

// ---------------------------------------------------------------------------
// Websocket adapter
// ---------------------------------------------------------------------------

pub struct OkxWs;

impl OkxWs {
    pub fn new(_market: MarketType) -> Self {
        // One public endpoint for every product family.
        Self
    }
}

impl WsAdapter for OkxWs {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn ws_url(&self, _input: &StreamInput) -> String {
        WS_PUBLIC.to_string()
    }

    fn subscribe_frames(&self, input: &StreamInput) -> Vec<String> {
        let args: Vec<Value> = input
            .symbols
            .iter()
            .map(|sym| {
                serde_json::json!({
                    "channel": format!("candle{}", bar(input.timeframe)),
                    "instId": sym,
                })
            })
            .collect();
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn normalize_ws(&self, value: &Value) -> Result<Option<Candle>, NormalizeError> {
        from_ws(value)
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct OkxApi {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl OkxApi {
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
impl CandleApi for OkxApi {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn window_limit(&self) -> usize {
        // /market/candles caps at 300 rows per request.
        300
    }

    async fn fetch_window(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>, ApiError> {
        // `after` pages records strictly older than the given ms timestamp,
        // `before` strictly newer; widen both ends by one to keep the bounds
        // inclusive.
        let url = format!(
            "{}?instId={}&bar={}&limit={}&before={}&after={}",
            REST_CANDLES,
            symbol,
            bar(timeframe),
            self.window_limit(),
            from_ts * 1000 - 1,
            to_ts * 1000 + 1,
        );

        loop {
            self.limiter.acquire().await;
            let resp = self.client.get(&url).send().await?;
            let status = resp.status();

            if status.as_u16() == 429 {
                warn!(
                    pause_s = RATE_LIMIT_PAUSE.as_secs(),
                    "okx rate limit exceeded, backing off"
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
            let code = body.get("code").and_then(Value::as_str).unwrap_or("");
            if code != "0" {
                let msg = body.get("msg").and_then(Value::as_str).unwrap_or("");
                return Err(ApiError::BadResponse(format!("code {code}: {msg}")));
            }

            let rows = body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| ApiError::BadResponse("missing data array".into()))?;

            // Newest-first on the wire.
            let mut candles = Vec::with_capacity(rows.len());
            for row in rows.iter().rev() {
                match from_rest(row, symbol, timeframe) {
                    Ok(c) => candles.push(c),
                    Err(e) => warn!(error = %e, "skipping malformed candle row"),
                }
            }
            return Ok(candles);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
