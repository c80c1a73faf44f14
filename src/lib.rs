// =============================================================================
// Candleforge — multi-exchange OHLCV ingestion engine
// =============================================================================
//
// Live candlestick streams from Binance, Bybit, OKX and Kraken are decoded,
// normalized onto one canonical record, optionally rolled up into higher
// timeframes, and fanned out to pluggable sinks (CSV, SQLite, in-memory
// channels). Historical backfill walks the same sink pipeline through each
// exchange's REST API.
//
// ```no_run
// use std::sync::Arc;
// use candleforge::{
//     CsvSink, Exchange, Runner, RunnerConfig, StreamInput, StreamKind, Timeframe,
// };
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let input = StreamInput::new(StreamKind::Kline, vec!["BTCUSDT".into()], Timeframe::M1)
//         .with_aggregates(vec![Timeframe::M5, Timeframe::M15]);
//     let runner = Runner::new(Exchange::Binance, input, RunnerConfig::default())
//         .with_sink(Arc::new(CsvSink::new("btc_1m.csv")));
//     runner.run().await
// }
// ```
// =============================================================================

pub mod backfill;
pub mod candle;
pub mod connector;
pub mod error;
pub mod exchange;
pub mod input;
pub mod limiter;
pub mod processor;
pub mod runner;
pub mod sink;
pub mod timeframe;
pub mod warmup;

// Re-export the types most callers touch.
pub use backfill::{Backfill, BackfillConfig};
pub use candle::{Candle, CandleKey};
pub use error::{ApiError, ConfigError, NormalizeError};
pub use exchange::Exchange;
pub use input::{MarketType, RunnerConfig, StreamInput, StreamKind};
pub use processor::CandleProcessor;
pub use runner::{merge_streams, Runner, ShutdownHandle};
pub use sink::{CsvSink, MemorySink, Sink, SinkFanout, SqliteSink, Transformer};
pub use timeframe::Timeframe;
