// =============================================================================
// backfill — CLI driver for historical candle retrieval
// =============================================================================
//
// Exit code 0 on completion; non-zero on invalid configuration or a fatal
// API error (IP ban).
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use candleforge::{
    Backfill, BackfillConfig, Exchange, MarketType, SqliteSink, Timeframe,
};

/// Download a date range of candles from an exchange into a CSV file or a
/// SQLite table.
#[derive(Debug, Parser)]
#[command(name = "backfill")]
struct Args {
    /// Exchange: binance, bybit, okx or kraken.
    #[arg(long)]
    exchange: String,

    /// Exchange-native symbol (BTCUSDT, BTC-USDT, BTC/USD).
    #[arg(long)]
    symbol: String,

    /// Candle timeframe (1m, 5m, 1h, 1d, ...).
    #[arg(long, default_value = "1m")]
    timeframe: String,

    /// Range start, YYYY-MM-DD (UTC midnight).
    #[arg(long)]
    from_date: String,

    /// Range end, YYYY-MM-DD or "now".
    #[arg(long, default_value = "now")]
    to_date: String,

    /// Market type: default, spot, usd-futures, coin-futures, linear,
    /// inverse.
    #[arg(long, default_value = "default")]
    market_type: String,

    /// Write into this SQLite database instead of the default CSV file.
    #[arg(long)]
    sqlite: Option<String>,

    /// Table name for the SQLite sink.
    #[arg(long, default_value = "candles")]
    table: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = BackfillConfig {
        exchange: Exchange::parse(&args.exchange)?,
        symbol: args.symbol,
        timeframe: Timeframe::parse(&args.timeframe)?,
        from_date: args.from_date,
        to_date: args.to_date,
        market_type: MarketType::parse(&args.market_type)?,
    };

    let mut backfill = Backfill::new(config);
    if let Some(path) = args.sqlite {
        backfill.register_sink(Arc::new(SqliteSink::new(path, &args.table)));
    }

    backfill.run().await
}
