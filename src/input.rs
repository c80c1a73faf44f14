// =============================================================================
// Stream and runner configuration value objects
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timeframe::Timeframe;

/// The channel family to subscribe to. Exchanges spell this differently
/// ("kline" on Binance/Bybit, "candle" on OKX, "ohlc" on Kraken) but they all
/// name the same OHLCV stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Kline,
    Candle,
    Ohlc,
    Ohlcv,
}

impl StreamKind {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "kline" => Ok(Self::Kline),
            "candle" => Ok(Self::Candle),
            "ohlc" => Ok(Self::Ohlc),
            "ohlcv" => Ok(Self::Ohlcv),
            other => Err(ConfigError::UnknownStreamKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kline => "kline",
            Self::Candle => "candle",
            Self::Ohlc => "ohlc",
            Self::Ohlcv => "ohlcv",
        }
    }
}

/// What a runner subscribes to: one base timeframe over a set of symbols,
/// optionally rolled up into higher timeframes.
#[derive(Debug, Clone)]
pub struct StreamInput {
    pub kind: StreamKind,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub aggregate_list: Vec<Timeframe>,
}

impl StreamInput {
    pub fn new(kind: StreamKind, symbols: Vec<String>, timeframe: Timeframe) -> Self {
        Self {
            kind,
            symbols,
            timeframe,
            aggregate_list: Vec::new(),
        }
    }

    /// Builder-style list of higher timeframes to synthesize from the base
    /// stream. Incompatible entries are dropped with a warning when the
    /// processor is built.
    pub fn with_aggregates(mut self, targets: Vec<Timeframe>) -> Self {
        self.aggregate_list = targets;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::EmptySymbols);
        }
        Ok(())
    }
}

/// Product family within an exchange. Selects the WS/REST URLs and the rate
/// limiter. Exchanges that do not distinguish markets ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketType {
    /// Exchange default (spot everywhere).
    Default,
    Spot,
    /// Binance USD-margined futures.
    UsdFutures,
    /// Binance coin-margined futures.
    CoinFutures,
    /// Bybit USDT/USDC perpetuals.
    Linear,
    /// Bybit inverse contracts.
    Inverse,
}

impl MarketType {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "spot" => Ok(Self::Spot),
            "usd-futures" | "usdm" => Ok(Self::UsdFutures),
            "coin-futures" | "coinm" => Ok(Self::CoinFutures),
            "linear" => Ok(Self::Linear),
            "inverse" => Ok(Self::Inverse),
            other => Err(ConfigError::UnknownMarketType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Spot => "spot",
            Self::UsdFutures => "usd-futures",
            Self::CoinFutures => "coin-futures",
            Self::Linear => "linear",
            Self::Inverse => "inverse",
        }
    }
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Default
    }
}

/// Behaviour switches for a runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Load history from REST at start. Mandatory when aggregation is
    /// configured.
    pub active_warmup: bool,
    /// Deliver warmup candles to sinks.
    pub emit_warmup: bool,
    /// Emit base candles only when the exchange marks them final.
    pub emit_only_closed_candles: bool,
    pub market_type: MarketType,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            active_warmup: true,
            emit_warmup: false,
            emit_only_closed_candles: true,
            market_type: MarketType::Default,
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
    fn stream_kind_parses_all_spellings() {
        assert_eq!(StreamKind::parse("kline").unwrap(), StreamKind::Kline);
        assert_eq!(StreamKind::parse("CANDLE").unwrap(), StreamKind::Candle);
        assert_eq!(StreamKind::parse("ohlc").unwrap(), StreamKind::Ohlc);
        assert_eq!(StreamKind::parse("ohlcv").unwrap(), StreamKind::Ohlcv);
        assert!(StreamKind::parse("trades").is_err());
    }

    #[test]
    fn empty_symbols_rejected() {
        let input = StreamInput::new(StreamKind::Kline, vec![], Timeframe::M1);
        assert!(input.validate().is_err());
    }

    #[test]
    fn market_type_parses() {
        assert_eq!(MarketType::parse("spot").unwrap(), MarketType::Spot);
        assert_eq!(MarketType::parse("LINEAR").unwrap(), MarketType::Linear);
        assert_eq!(MarketType::parse("usdm").unwrap(), MarketType::UsdFutures);
        assert!(MarketType::parse("options").is_err());
    }
}
