// =============================================================================
// Error kinds shared across the engine
// =============================================================================
//
// The split mirrors how errors propagate: normalization errors are logged and
// the frame dropped, API errors distinguish fatal bans from retryable
// transport failures, and configuration errors fail fast before any
// connection is opened.
// =============================================================================

use thiserror::Error;

/// A wire message or REST row that could not be mapped onto the canonical
/// candle. The surrounding connection is never torn down over one of these.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("invalid candle: {0}")]
    InvalidCandle(String),
}

/// REST client failure.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 418/403 — the exchange has banned this IP. Non-retryable.
    #[error("{exchange}: IP banned (HTTP {status})")]
    Banned { exchange: &'static str, status: u16 },

    #[error("{exchange}: HTTP {status} for {url}")]
    Http {
        exchange: &'static str,
        status: u16,
        url: String,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    BadResponse(String),
}

impl ApiError {
    /// Fatal errors abort the surrounding job instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Banned { .. })
    }
}

/// Invalid runner or backfill configuration. Raised before any connection
/// is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("aggregation requires warmup: enable `active_warmup` or drop `aggregate_list`")]
    WarmupRequired,

    #[error("unknown timeframe `{0}`")]
    UnknownTimeframe(String),

    #[error("unknown stream type `{0}`")]
    UnknownStreamKind(String),

    #[error("unknown exchange `{0}`")]
    UnknownExchange(String),

    #[error("unknown market type `{0}`")]
    UnknownMarketType(String),

    #[error("no symbols provided")]
    EmptySymbols,

    #[error("invalid date `{date}`: expected YYYY-MM-DD or \"now\"")]
    InvalidDate { date: String },
}
