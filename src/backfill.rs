// =============================================================================
// Backfill — paged historical retrieval into the sink pipeline
// =============================================================================
//
// Walks a date range window by window through an exchange's REST client and
// bulk-emits the normalized candles to the registered sinks. When no sink is
// registered the driver falls back to a CSV file with a generated name.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use tracing::info;

use crate::error::ConfigError;
use crate::exchange::{candle_api, split_windows, CandleApi, Exchange};
use crate::input::MarketType;
use crate::sink::{CsvSink, Sink, SinkFanout, Transformer};
use crate::timeframe::Timeframe;

/// Everything a backfill job needs. Dates are `YYYY-MM-DD` strings parsed
/// as UTC midnight; `to_date` also accepts the keyword `"now"`, which
/// resolves to the current UTC second.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub exchange: Exchange,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from_date: String,
    pub to_date: String,
    pub market_type: MarketType,
}

/// Parse a `YYYY-MM-DD` date literal (or `"now"`) to epoch seconds UTC.
pub fn parse_date_utc(date: &str) -> Result<i64, ConfigError> {
    if date == "now" {
        return Ok(Utc::now().timestamp());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|d| {
            d.and_hms_opt(0, 0, 0)
                .expect("midnight exists")
                .and_utc()
                .timestamp()
        })
        .map_err(|_| ConfigError::InvalidDate {
            date: date.to_string(),
        })
}

pub struct Backfill {
    config: BackfillConfig,
    fanout: SinkFanout,
    transformer: Option<Transformer>,
}

impl Backfill {
    pub fn new(config: BackfillConfig) -> Self {
        Self {
            config,
            fanout: SinkFanout::new(),
            transformer: None,
        }
    }

    pub fn register_sink(&mut self, sink: Arc<dyn Sink>) {
        self.fanout.add(sink);
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.fanout.add(sink);
        self
    }

    /// Transformer applied by the default CSV sink. Explicitly registered
    /// sinks carry their own transformers.
    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn set_transformer(&mut self, transformer: Transformer) {
        self.transformer = Some(transformer);
    }

    /// Generated CSV filename for the default sink:
    /// `<Exchange>-<symbol>-<market>-<tf>-<from>_<to>.csv`.
    fn default_file_name(&self) -> String {
        let to = if self.config.to_date == "now" {
            Utc::now().format("%Y-%m-%d").to_string()
        } else {
            self.config.to_date.clone()
        };
        format!(
            "{}-{}-{}-{}-{}_{}.csv",
            self.config.exchange,
            self.config.symbol.replace('/', ""),
            self.config.market_type.as_str(),
            self.config.timeframe,
            self.config.from_date,
            to,
        )
    }

    /// Execute the job. Returns an error on invalid configuration or a
    /// fatal API failure (ban); rate limiting is absorbed by the client.
    pub async fn run(mut self) -> Result<()> {
        if self.fanout.is_empty() {
            let path = self.default_file_name();
            let mut sink = CsvSink::new(&path);
            if let Some(t) = self.transformer.clone() {
                sink.set_transformer(t);
            }
            info!(path, "no sink registered, writing CSV");
            self.fanout.add(Arc::new(sink));
        }

        let api = candle_api(self.config.exchange, self.config.market_type);
        self.run_with_api(api.as_ref()).await
    }

    async fn run_with_api(self, api: &dyn CandleApi) -> Result<()> {
        let from_ts = parse_date_utc(&self.config.from_date)?;
        let to_ts = match self.config.to_date.as_str() {
            // Inclusive end at the current second.
            "now" => Utc::now().timestamp(),
            // A date bound is exclusive: 2024-10-01..2024-10-02 covers
            // exactly the first of October.
            date => parse_date_utc(date)? - 1,
        };
        if from_ts >= to_ts {
            bail!(
                "empty backfill range: {} .. {}",
                self.config.from_date,
                self.config.to_date
            );
        }

        info!(
            exchange = %self.config.exchange,
            symbol = %self.config.symbol,
            timeframe = %self.config.timeframe,
            from = %self.config.from_date,
            to = %self.config.to_date,
            "backfill starting"
        );

        self.fanout.connect_all().await;

        let now = Utc::now().timestamp();
        let mut total = 0usize;
        for (start, end) in split_windows(from_ts, to_ts, self.config.timeframe, api.window_limit())
        {
            let mut batch = api
                .fetch_window(&self.config.symbol, self.config.timeframe, start, end)
                .await
                .context("backfill window fetch failed")?;
            // Keep the window honest: completed candles inside the range
            // only, even when the endpoint over-returns.
            batch.retain(|c| c.open_ts >= start && c.open_ts <= end && c.end_ts < now);
            total += batch.len();
            self.fanout.emit_bulk(&batch).await;
        }

        self.fanout.close_all().await;
        info!(total, "backfill finished");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
