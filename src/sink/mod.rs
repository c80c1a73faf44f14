// =============================================================================
// Sinks — terminal destinations for canonical candles
// =============================================================================
//
// The fanout dispatches every emission to every registered sink in order.
// A failing sink logs its error and never blocks the others; durability and
// retries are each sink's own business.
// =============================================================================

pub mod csv;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use crate::candle::Candle;

pub use self::csv::CsvSink;
pub use self::memory::MemorySink;
pub use self::sqlite::SqliteSink;

/// A delivered record: the canonical candle flattened to named columns,
/// in declaration order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Pure pre-delivery mapping applied by a sink to each record.
pub type Transformer = Arc<dyn Fn(Row) -> Row + Send + Sync>;

/// Terminal destination for candles. Implementations handle their own
/// internal synchronization; one sink instance may be registered with
/// several runners.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name for log lines ("csv", "sqlite", ...).
    fn name(&self) -> &str;

    /// Acquire resources (file handle, connection, producer).
    async fn connect(&self) -> Result<()>;

    /// Deliver one record.
    async fn emit(&self, candle: &Candle) -> Result<()>;

    /// Deliver a batch. The default loops [`Sink::emit`]; sinks with a
    /// cheaper bulk path override it.
    async fn emit_bulk(&self, candles: &[Candle]) -> Result<()> {
        for candle in candles {
            self.emit(candle).await?;
        }
        Ok(())
    }

    /// Flush and release resources.
    async fn close(&self) -> Result<()>;
}

/// Ordered collection of sinks fed by one runner (or one backfill job).
#[derive(Default)]
pub struct SinkFanout {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Arc<dyn Sink>) {
        info!(sink = sink.name(), "sink registered");
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub async fn connect_all(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.connect().await {
                error!(sink = sink.name(), error = %e, "sink connect failed");
            }
        }
    }

    /// Deliver one candle to every sink. Failures are logged per sink and
    /// do not stop the rest.
    pub async fn emit(&self, candle: &Candle) {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(candle).await {
                error!(sink = sink.name(), key = %candle.key(), error = %e, "sink emit failed");
            }
        }
    }

    pub async fn emit_bulk(&self, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }
        for sink in &self.sinks {
            if let Err(e) = sink.emit_bulk(candles).await {
                error!(sink = sink.name(), count = candles.len(), error = %e, "sink bulk emit failed");
            }
        }
    }

    pub async fn close_all(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                error!(sink = sink.name(), error = %e, "sink close failed");
            }
        }
    }
}

/// Apply an optional transformer to a candle's canonical row form.
pub(crate) fn to_row(candle: &Candle, transformer: Option<&Transformer>) -> Row {
    let row = candle.to_row();
    match transformer {
        Some(t) => t(row),
        None => row,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframe::Timeframe;
    use parking_lot::Mutex;

    fn sample(open_ts: i64) -> Candle {
        Candle {
            source: "binance".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_ts,
            end_ts: open_ts + 59,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            quote_volume: Some(15.0),
            is_closed: true,
            count: None,
        }
    }

    struct RecordingSink {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn emit(&self, candle: &Candle) -> Result<()> {
            self.seen.lock().push(candle.open_ts);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn emit(&self, _candle: &Candle) -> Result<()> {
            anyhow::bail!("sink intentionally broken")
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn faulty_sink_does_not_starve_the_others() {
        let recording = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });

        let mut fanout = SinkFanout::new();
        fanout.add(Arc::new(FailingSink));
        fanout.add(recording.clone());

        for i in 0..3 {
            fanout.emit(&sample(i * 60)).await;
        }

        assert_eq!(*recording.seen.lock(), vec![0, 60, 120]);
    }

    #[tokio::test]
    async fn bulk_default_loops_emit_in_order() {
        let recording = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let mut fanout = SinkFanout::new();
        fanout.add(recording.clone());

        let batch: Vec<Candle> = (0..4).map(|i| sample(i * 60)).collect();
        fanout.emit_bulk(&batch).await;

        assert_eq!(*recording.seen.lock(), vec![0, 60, 120, 180]);
    }

    #[test]
    fn transformer_rewrites_rows() {
        let t: Transformer = Arc::new(|mut row| {
            row.remove("quote_volume");
            row.insert("tagged".into(), serde_json::json!(true));
            row
        });
        let row = to_row(&sample(0), Some(&t));
        assert!(row.get("quote_volume").is_none());
        assert_eq!(row["tagged"], serde_json::json!(true));
        assert_eq!(row["symbol"], serde_json::json!("BTCUSDT"));
    }
}
