// =============================================================================
// Warmup loader — seed processor buffers from REST before streaming
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use tracing::info;

use crate::candle::Candle;
use crate::error::ApiError;
use crate::exchange::CandleApi;
use crate::input::StreamInput;
use crate::timeframe::Timeframe;

const DAY_SECS: i64 = 86_400;

/// Start of the warmup fetch window: the current UTC day boundary or the
/// start of the in-progress bucket of the largest aggregation target,
/// whichever reaches further back.
pub(crate) fn warmup_start(now_ts: i64, largest_target: Option<Timeframe>) -> i64 {
    let day_start = (now_ts / DAY_SECS) * DAY_SECS;
    match largest_target.and_then(|t| t.fixed_duration_secs()) {
        Some(dur) => day_start.min((now_ts / dur) * dur),
        None => day_start,
    }
}

/// Fetch completed candles for every symbol of `input`. The returned
/// candles are forcibly closed; a still-running interval at the tail of the
/// REST response is dropped.
pub async fn load(
    api: &dyn CandleApi,
    input: &StreamInput,
    largest_target: Option<Timeframe>,
) -> Result<HashMap<String, Vec<Candle>>, ApiError> {
    let now = Utc::now().timestamp();
    let since = warmup_start(now, largest_target);

    let mut loaded = HashMap::new();
    for symbol in &input.symbols {
        let mut candles = api.fetch_recent(symbol, input.timeframe, since).await?;
        candles.retain(|c| c.end_ts < now);
        for c in &mut candles {
            c.is_closed = true;
        }
        info!(
            source = api.source(),
            symbol = %symbol,
            timeframe = %input.timeframe,
            count = candles.len(),
            "warmup history fetched"
        );
        loaded.insert(symbol.clone(), candles);
    }
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
