// =============================================================================
// CSV sink — append-only file writer
// =============================================================================
//
// Opens the file in append mode and writes the header row only when the file
// does not exist yet. Columns are the keys of the transformed record, which
// are the canonical candle field names when no transformer is set.
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::candle::Candle;
use crate::sink::{to_row, Row, Sink, Transformer};

struct CsvState {
    writer: Option<csv::Writer<std::fs::File>>,
    /// Column order, fixed by the first record written.
    columns: Option<Vec<String>>,
    needs_header: bool,
}

pub struct CsvSink {
    path: PathBuf,
    transformer: Option<Transformer>,
    state: Mutex<CsvState>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            transformer: None,
            state: Mutex::new(CsvState {
                writer: None,
                columns: None,
                needs_header: false,
            }),
        }
    }

    /// Fluent transformer configuration.
    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// In-place transformer configuration; identical behaviour to
    /// [`CsvSink::with_transformer`].
    pub fn set_transformer(&mut self, transformer: Transformer) {
        self.transformer = Some(transformer);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_row(&self, row: &Row) -> Result<()> {
        let mut state = self.state.lock();

        if state.writer.is_none() {
            let exists = self.path.exists();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("opening {}", self.path.display()))?;
            state.writer = Some(csv::WriterBuilder::new().has_headers(false).from_writer(file));
            state.needs_header = !exists;
        }

        if state.columns.is_none() {
            state.columns = Some(row.keys().cloned().collect());
        }
        let columns = state.columns.clone().expect("columns fixed above");

        if state.needs_header {
            state
                .writer
                .as_mut()
                .expect("writer opened above")
                .write_record(&columns)?;
            state.needs_header = false;
        }

        let record: Vec<String> = columns
            .iter()
            .map(|col| match row.get(col) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect();

        let writer = state.writer.as_mut().expect("writer opened above");
        writer.write_record(&record)?;
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn connect(&self) -> Result<()> {
        debug!(path = %self.path.display(), "csv sink ready");
        Ok(())
    }

    async fn emit(&self, candle: &Candle) -> Result<()> {
        let row = to_row(candle, self.transformer.as_ref());
        self.write_row(&row)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        state.writer = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframe::Timeframe;
    use std::sync::Arc;

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

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "candleforge-csv-{}-{}.csv",
            tag,
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn header_written_once_across_reopens() {
        let path = temp_path("header");
        let _ = std::fs::remove_file(&path);

        let sink = CsvSink::new(&path);
        sink.connect().await.unwrap();
        sink.emit(&sample(0)).await.unwrap();
        sink.emit(&sample(60)).await.unwrap();
        sink.close().await.unwrap();

        // A second sink appending to the existing file must not repeat the
        // header.
        let sink = CsvSink::new(&path);
        sink.connect().await.unwrap();
        sink.emit(&sample(120)).await.unwrap();
        sink.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4); // header + 3 rows
        assert!(lines[0].starts_with("source,symbol,timeframe,open_ts"));
        assert!(lines[1].starts_with("binance,BTCUSDT,1m,0"));
        assert!(lines[3].starts_with("binance,BTCUSDT,1m,120"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn transformer_controls_columns() {
        let path = temp_path("transform");
        let _ = std::fs::remove_file(&path);

        let transformer: Transformer = Arc::new(|row| {
            let mut out = Row::new();
            out.insert("ts".into(), row["open_ts"].clone());
            out.insert("close".into(), row["close"].clone());
            out
        });
        let sink = CsvSink::new(&path).with_transformer(transformer);
        sink.connect().await.unwrap();
        sink.emit(&sample(0)).await.unwrap();
        sink.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "ts,close");
        assert_eq!(lines[1], "0,1.5");

        let _ = std::fs::remove_file(&path);
    }
}
